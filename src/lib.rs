//! EraseFE: object removal and content-aware fill for RGBA images.
//!
//! Strokes become weighted masks ([`ops::stroke_mask`]); masks are filled by
//! cloning, healing, or a PatchMatch nearest-neighbour field followed by
//! gradient-domain blending ([`ops::inpaint`], [`ops::region_fill`],
//! [`ops::gradient_blend`]). [`removal::RemovalSession`] drives the whole
//! thing, including the optional remote service gated by [`quota`].

#![allow(clippy::too_many_arguments)]

#[macro_use]
pub mod logger;
pub mod components;
pub mod io;
pub mod ops;
pub mod quota;
pub mod removal;
pub mod settings;

pub use ops::stroke_mask::{BrushParams, FillMode, Mask, Point, Stroke};
pub use removal::{CommitOutcome, RemovalError, RemovalPath, RemovalPipeline, RemovalSession, Stage, StageEvent};
pub use settings::RemovalSettings;
