//! Captured pen strokes for drawn signatures.

use kurbo::{BezPath, Point, Rect};
use serde::{Deserialize, Serialize};

/// A single sampled pen position. Pressure and other device data are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrokePoint {
    pub x: f64,
    pub y: f64,
    /// Capture time in milliseconds, relative to an arbitrary origin.
    #[serde(default)]
    pub t: u64,
}

impl StrokePoint {
    pub fn new(x: f64, y: f64, t: u64) -> Self {
        Self { x, y, t }
    }

    pub fn point(&self) -> Point {
        Point::new(self.x, self.y)
    }
}

/// One pen-down to pen-up path, in capture coordinates (y down).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Stroke {
    pub points: Vec<StrokePoint>,
}

impl Stroke {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create from `(x, y)` pairs, timestamps spaced 10ms apart.
    pub fn from_xy(points: &[(f64, f64)]) -> Self {
        Self {
            points: points
                .iter()
                .enumerate()
                .map(|(i, &(x, y))| StrokePoint::new(x, y, i as u64 * 10))
                .collect(),
        }
    }

    pub fn add_point(&mut self, point: StrokePoint) {
        self.points.push(point);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Whether every coordinate is a finite number.
    pub fn is_finite(&self) -> bool {
        self.points.iter().all(|p| p.x.is_finite() && p.y.is_finite())
    }

    /// Bounding box of the sampled points.
    pub fn bounds(&self) -> Rect {
        if self.points.is_empty() {
            return Rect::ZERO;
        }

        let mut min_x = f64::MAX;
        let mut min_y = f64::MAX;
        let mut max_x = f64::MIN;
        let mut max_y = f64::MIN;

        for point in &self.points {
            min_x = min_x.min(point.x);
            min_y = min_y.min(point.y);
            max_x = max_x.max(point.x);
            max_y = max_y.max(point.y);
        }

        Rect::new(min_x, min_y, max_x, max_y)
    }

    /// Polyline through the sampled points.
    pub fn to_path(&self) -> BezPath {
        let mut path = BezPath::new();
        let mut points = self.points.iter();
        if let Some(first) = points.next() {
            path.move_to(first.point());
            for point in points {
                path.line_to(point.point());
            }
        }
        path
    }

    /// Simplified copy of the stroke (Ramer-Douglas-Peucker).
    pub fn simplified(&self, tolerance: f64) -> Stroke {
        Stroke {
            points: rdp_simplify(&self.points, tolerance),
        }
    }
}

/// Union of the bounds of all non-empty strokes.
pub fn strokes_bounds(strokes: &[Stroke]) -> Option<Rect> {
    strokes
        .iter()
        .filter(|s| !s.is_empty())
        .map(Stroke::bounds)
        .reduce(|a, b| a.union(b))
}

fn rdp_simplify(points: &[StrokePoint], tolerance: f64) -> Vec<StrokePoint> {
    if points.len() < 3 {
        return points.to_vec();
    }

    let first = points[0];
    let last = points[points.len() - 1];

    let mut max_dist = 0.0;
    let mut max_index = 0;

    for (i, point) in points.iter().enumerate().skip(1).take(points.len() - 2) {
        let dist = perpendicular_distance(point.point(), first.point(), last.point());
        if dist > max_dist {
            max_dist = dist;
            max_index = i;
        }
    }

    if max_dist > tolerance {
        let mut left = rdp_simplify(&points[..=max_index], tolerance);
        let right = rdp_simplify(&points[max_index..], tolerance);

        // Junction point appears in both halves.
        left.pop();
        left.extend(right);
        left
    } else {
        vec![first, last]
    }
}

fn perpendicular_distance(point: Point, line_start: Point, line_end: Point) -> f64 {
    let dx = line_end.x - line_start.x;
    let dy = line_end.y - line_start.y;

    let line_len_sq = dx * dx + dy * dy;
    if line_len_sq < f64::EPSILON {
        return point.distance(line_start);
    }

    let area2 = ((point.x - line_start.x) * dy - (point.y - line_start.y) * dx).abs();
    area2 / line_len_sq.sqrt()
}
