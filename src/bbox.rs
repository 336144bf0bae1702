//! Axis-aligned boxes, overlap and clustering.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Floating point rectangle in pixel coordinates, top-left origin.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Integer rectangle obtained by snapping a `BoundingBox` to pixel corners.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelRect {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl PixelRect {
    pub fn area(&self) -> usize {
        self.width * self.height
    }
}

impl BoundingBox {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// A box without positive extent in both directions.
    pub fn is_empty(&self) -> bool {
        !(self.width > 0. && self.height > 0.)
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    pub fn area(&self) -> f64 {
        if self.is_empty() {
            0.
        } else {
            self.width * self.height
        }
    }

    pub fn intersection(&self, other: &BoundingBox) -> Option<BoundingBox> {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        let b = BoundingBox::new(x, y, right - x, bottom - y);
        if b.is_empty() {
            None
        } else {
            Some(b)
        }
    }

    /// Intersection over union, 0 for disjoint or degenerate boxes.
    pub fn iou(&self, other: &BoundingBox) -> f64 {
        let intersection = self.intersection(other).map_or(0., |b| b.area());
        let union = self.area() + other.area() - intersection;
        if union <= 0. {
            return 0.;
        }
        intersection / union
    }

    /// True if the box lies inside a `width × height` frame.
    pub fn is_within(&self, width: usize, height: usize) -> bool {
        self.x >= 0. && self.y >= 0. && self.right() <= width as f64 && self.bottom() <= height as f64
    }

    /// Part of the box inside a `width × height` frame.
    pub fn clip(&self, width: usize, height: usize) -> Option<BoundingBox> {
        self.intersection(&BoundingBox::new(0., 0., width as f64, height as f64))
    }

    pub fn translate(&self, dx: f64, dy: f64) -> BoundingBox {
        BoundingBox::new(self.x + dx, self.y + dy, self.width, self.height)
    }

    /// Scale the extent, keeping the top-left corner.
    pub fn scale(&self, s: f64) -> BoundingBox {
        BoundingBox::new(self.x, self.y, s * self.width, s * self.height)
    }

    /// Snap the corners to the nearest pixel grid lines.
    ///
    /// Returns `None` if a corner is negative or the snapped rectangle is
    /// degenerate.
    pub fn pixel_rect(&self) -> Option<PixelRect> {
        let x0 = self.x.round();
        let y0 = self.y.round();
        let x1 = self.right().round();
        let y1 = self.bottom().round();
        if x0 < 0. || y0 < 0. || x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(PixelRect {
            x: x0 as usize,
            y: y0 as usize,
            width: (x1 - x0) as usize,
            height: (y1 - y0) as usize,
        })
    }
}

/// Cluster boxes whose pairwise IoU reaches `overlap_threshold` and replace
/// each connected component by its coordinate-wise mean.
///
/// Clusters are emitted in the order of their first member. No scores are
/// involved, so this is not the greedy suppression used by most detectors.
pub fn nms(boxes: &[BoundingBox], overlap_threshold: f64) -> Vec<BoundingBox> {
    let n = boxes.len();
    let adjacency: Vec<Vec<usize>> = (0..n)
        .map(|i| {
            (0..n)
                .filter(|&j| boxes[i].iou(&boxes[j]) >= overlap_threshold)
                .collect()
        })
        .collect();

    let mut seen = vec![false; n];
    let mut queue = VecDeque::new();
    let mut clusters = vec![];
    for i in 0..n {
        if seen[i] {
            continue;
        }
        seen[i] = true;
        queue.push_back(i);
        let mut members = vec![i];
        while let Some(k) = queue.pop_front() {
            for &j in &adjacency[k] {
                if !seen[j] {
                    seen[j] = true;
                    members.push(j);
                    queue.push_back(j);
                }
            }
        }
        clusters.push(members);
    }

    clusters
        .iter()
        .map(|members| {
            let count = members.len() as f64;
            let mut mean = BoundingBox::default();
            for &i in members {
                mean.x += boxes[i].x;
                mean.y += boxes[i].y;
                mean.width += boxes[i].width;
                mean.height += boxes[i].height;
            }
            BoundingBox::new(
                mean.x / count,
                mean.y / count,
                mean.width / count,
                mean.height / count,
            )
        })
        .collect()
}
