pub mod ai;
pub mod gradient_blend;
pub mod inpaint;
pub mod region_fill;
pub mod spot_removal;
pub mod stroke_mask;
