use image::RgbaImage;

use crate::ops::stroke_mask::{BrushParams, Point, Stroke};

// ============================================================================
// ACTIVATION SNAPSHOT - pixel buffer as it was when the tool was activated
// ============================================================================

/// Full copy of the working buffer taken at activation. Cancel restores it.
#[derive(Clone, Debug)]
pub struct ActivationSnapshot {
    pixels: RgbaImage,
}

impl ActivationSnapshot {
    pub fn capture(image: &RgbaImage) -> Self {
        Self {
            pixels: image.clone(),
        }
    }

    pub fn restore(&self) -> RgbaImage {
        self.pixels.clone()
    }

    pub fn memory_size(&self) -> usize {
        self.pixels.as_raw().len()
    }
}

// ============================================================================
// STROKE HISTORY - uncommitted strokes, drawing never touches pixels
// ============================================================================

/// Strokes accumulated since the last commit, plus the one being drawn.
#[derive(Clone, Debug, Default)]
pub struct StrokeHistory {
    pending: Vec<Stroke>,
    current: Option<Stroke>,
}

impl StrokeHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a stroke (input-down). An unfinished stroke is finished first.
    pub fn begin(&mut self, brush: BrushParams, start: Point, source: Option<Point>) {
        self.finish();
        self.current = Some(Stroke::new(brush, start).with_source(source));
    }

    /// Add a sample to the stroke being drawn (input-move). Returns false if
    /// no stroke is in progress.
    pub fn extend(&mut self, p: Point) -> bool {
        match self.current.as_mut() {
            Some(stroke) => {
                stroke.push(p);
                true
            }
            None => false,
        }
    }

    /// Finalize the stroke being drawn (input-up).
    pub fn finish(&mut self) -> bool {
        match self.current.take() {
            Some(stroke) if !stroke.is_empty() => {
                self.pending.push(stroke);
                true
            }
            _ => false,
        }
    }

    /// Queue an already complete stroke.
    pub fn push(&mut self, stroke: Stroke) {
        if !stroke.is_empty() {
            self.pending.push(stroke);
        }
    }

    /// Remove the most recent stroke, the in-progress one if any.
    pub fn undo(&mut self) -> Option<Stroke> {
        self.current.take().or_else(|| self.pending.pop())
    }

    /// Take every finished stroke, oldest first.
    pub fn drain(&mut self) -> Vec<Stroke> {
        std::mem::take(&mut self.pending)
    }

    /// Put strokes that could not be committed back in front of the queue.
    pub fn requeue_front(&mut self, mut strokes: Vec<Stroke>) {
        if strokes.is_empty() {
            return;
        }
        strokes.append(&mut self.pending);
        self.pending = strokes;
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.current = None;
    }

    pub fn strokes(&self) -> &[Stroke] {
        &self.pending
    }

    /// Finished strokes waiting for a commit.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.current.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn brush() -> BrushParams {
        BrushParams::default()
    }

    #[test]
    fn begin_extend_finish_queues_a_stroke() {
        let mut h = StrokeHistory::new();
        h.begin(brush(), Point::new(1.0, 1.0), None);
        assert!(h.extend(Point::new(2.0, 1.0)));
        assert!(h.extend(Point::new(2.0, 1.0)));
        assert!(h.finish());
        assert_eq!(h.len(), 1);
        assert_eq!(h.strokes()[0].points.len(), 2);
        assert!(!h.extend(Point::new(3.0, 3.0)));
    }

    #[test]
    fn undo_prefers_the_stroke_in_progress() {
        let mut h = StrokeHistory::new();
        h.begin(brush(), Point::new(0.0, 0.0), None);
        h.finish();
        h.begin(brush(), Point::new(9.0, 9.0), Some(Point::new(1.0, 1.0)));

        let undone = h.undo().unwrap();
        assert_eq!(undone.points[0], Point::new(9.0, 9.0));
        assert_eq!(undone.source, Some(Point::new(1.0, 1.0)));
        assert_eq!(h.len(), 1);
        assert!(h.undo().is_some());
        assert!(h.undo().is_none());
        assert!(h.is_empty());
    }

    #[test]
    fn requeued_strokes_go_first() {
        let mut h = StrokeHistory::new();
        h.push(Stroke::new(brush(), Point::new(5.0, 5.0)));
        h.requeue_front(vec![Stroke::new(brush(), Point::new(1.0, 1.0))]);
        let drained = h.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].points[0], Point::new(1.0, 1.0));
        assert!(h.is_empty());
    }

    #[test]
    fn snapshot_restores_original_pixels() {
        let mut img = RgbaImage::from_pixel(4, 4, Rgba([7, 7, 7, 255]));
        let snap = ActivationSnapshot::capture(&img);
        img.put_pixel(0, 0, Rgba([0, 0, 0, 0]));
        assert_eq!(snap.restore(), RgbaImage::from_pixel(4, 4, Rgba([7, 7, 7, 255])));
        assert_eq!(snap.memory_size(), 64);
    }
}
