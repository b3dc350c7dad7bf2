use crate::normalize::Raster;

/// A rectangle in preview coordinates, both axes normalized to `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Selection {
    pub tl_x: f64,
    pub tl_y: f64,
    pub br_x: f64,
    pub br_y: f64,
}

impl Default for Selection {
    fn default() -> Self {
        Self::FULL
    }
}

impl Selection {
    pub const FULL: Self = Self {
        tl_x: 0.0,
        tl_y: 0.0,
        br_x: 1.0,
        br_y: 1.0,
    };

    /// Clamps into the unit square and orders the corners.
    pub fn new(tl_x: f64, tl_y: f64, br_x: f64, br_y: f64) -> Self {
        let clamp = |v: f64| if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
        let (x1, x2) = (clamp(tl_x), clamp(br_x));
        let (y1, y2) = (clamp(tl_y), clamp(br_y));

        Self {
            tl_x: x1.min(x2),
            tl_y: y1.min(y2),
            br_x: x1.max(x2),
            br_y: y1.max(y2),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.br_x <= self.tl_x || self.br_y <= self.tl_y
    }

    /// Device-unit corners for an area of `max_x` by `max_y`.
    pub fn to_device(&self, max_x: f64, max_y: f64) -> [f64; 4] {
        [
            self.tl_x * max_x,
            self.tl_y * max_y,
            self.br_x * max_x,
            self.br_y * max_y,
        ]
    }
}

/// Finds document regions in a preview.
pub trait RegionDetector: Send {
    fn find_regions(&self, preview: &Raster) -> Vec<Selection>;
}

/// Recorded selections and how many of them a running final scan has taken.
#[derive(Debug, Clone, Default)]
pub(crate) struct SelectionQueue {
    selections: Vec<Selection>,
    cursor: usize,
}

impl SelectionQueue {
    pub fn push(&mut self, selection: Selection) {
        self.selections.push(selection);
    }

    pub fn replace(&mut self, selections: Vec<Selection>) {
        self.selections = selections;
        self.cursor = 0;
    }

    pub fn clear(&mut self) {
        self.replace(Vec::new());
    }

    pub fn len(&self) -> usize {
        self.selections.len()
    }

    pub fn as_slice(&self) -> &[Selection] {
        &self.selections
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Takes the next selection; an empty queue yields `fallback` once.
    pub fn next(&mut self, fallback: Selection) -> Option<Selection> {
        let selection = match self.selections.get(self.cursor) {
            Some(selection) => *selection,
            None if self.cursor == 0 && self.selections.is_empty() => fallback,
            None => return None,
        };
        self.cursor += 1;
        Some(selection)
    }

    pub fn has_more(&self) -> bool {
        self.cursor < self.selections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_orders_and_clamps() {
        let selection = Selection::new(0.8, 1.5, 0.2, -0.1);
        assert_eq!(selection, Selection::new(0.2, 0.0, 0.8, 1.0));
        assert!(!selection.is_empty());
        assert!(Selection::new(0.5, 0.5, 0.5, 0.9).is_empty());
    }

    #[test]
    fn maps_to_device_units() {
        let selection = Selection::new(0.25, 0.5, 0.75, 1.0);
        assert_eq!(selection.to_device(200.0, 100.0), [50.0, 50.0, 150.0, 100.0]);
    }

    #[test]
    fn queue_hands_out_selections_in_order() {
        let first = Selection::new(0.0, 0.0, 0.5, 0.5);
        let second = Selection::new(0.5, 0.5, 1.0, 1.0);

        let mut queue = SelectionQueue::default();
        queue.push(first);
        queue.push(second);

        assert_eq!(queue.next(Selection::FULL), Some(first));
        assert!(queue.has_more());
        assert_eq!(queue.next(Selection::FULL), Some(second));
        assert!(!queue.has_more());
        assert_eq!(queue.next(Selection::FULL), None);

        queue.rewind();
        assert_eq!(queue.next(Selection::FULL), Some(first));
    }

    #[test]
    fn empty_queue_falls_back_once() {
        let mut queue = SelectionQueue::default();
        assert_eq!(queue.next(Selection::FULL), Some(Selection::FULL));
        assert!(!queue.has_more());
        assert_eq!(queue.next(Selection::FULL), None);
    }
}
