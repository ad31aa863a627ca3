//! Coordinate mapping between normalized field rects and PDF page space.
//!
//! Field positions are stored normalized to the page *as displayed*: the
//! origin is the top-left corner, y grows downwards and both axes run from
//! 0 to 1. PDF content lives in the unrotated user space of the page, with the
//! origin at the bottom-left of the media box and y growing upwards. The page's
//! `/Rotate` value is applied clockwise by viewers when the page is shown.

use kurbo::{Affine, Point, Rect, Size, Vec2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tolerance used for bounds checks and round-trip comparisons.
pub const EPSILON: f64 = 1e-6;

/// Page rotation, clockwise as displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// All supported rotations.
    pub const ALL: [Rotation; 4] = [
        Rotation::Deg0,
        Rotation::Deg90,
        Rotation::Deg180,
        Rotation::Deg270,
    ];

    /// Parse a `/Rotate` value. PDF allows any multiple of 90, including
    /// negative values and values past 360.
    pub fn from_degrees(degrees: i64) -> Option<Self> {
        if degrees % 90 != 0 {
            return None;
        }
        match degrees.rem_euclid(360) {
            0 => Some(Rotation::Deg0),
            90 => Some(Rotation::Deg90),
            180 => Some(Rotation::Deg180),
            270 => Some(Rotation::Deg270),
            _ => None,
        }
    }

    /// Rotation in degrees.
    pub fn degrees(self) -> i64 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    /// Whether the displayed page has width and height swapped.
    pub fn is_sideways(self) -> bool {
        matches!(self, Rotation::Deg90 | Rotation::Deg270)
    }

    /// Maps native normalized coordinates (top-left origin, y down) to
    /// displayed normalized coordinates, rotating about the page center.
    fn native_to_display(self) -> Affine {
        match self {
            Rotation::Deg0 => Affine::IDENTITY,
            // (u, v) -> (1 - v, u)
            Rotation::Deg90 => Affine::new([0.0, 1.0, -1.0, 0.0, 1.0, 0.0]),
            // (u, v) -> (1 - u, 1 - v)
            Rotation::Deg180 => Affine::new([-1.0, 0.0, 0.0, -1.0, 1.0, 1.0]),
            // (u, v) -> (v, 1 - u)
            Rotation::Deg270 => Affine::new([0.0, -1.0, 1.0, 0.0, 0.0, 1.0]),
        }
    }

    /// Exact inverse of [`Rotation::native_to_display`].
    fn display_to_native(self) -> Affine {
        match self {
            Rotation::Deg0 => Affine::IDENTITY,
            Rotation::Deg90 => Affine::new([0.0, -1.0, 1.0, 0.0, 0.0, 1.0]),
            Rotation::Deg180 => Affine::new([-1.0, 0.0, 0.0, -1.0, 1.0, 1.0]),
            Rotation::Deg270 => Affine::new([0.0, 1.0, -1.0, 0.0, 1.0, 0.0]),
        }
    }
}

impl TryFrom<i64> for Rotation {
    type Error = String;

    fn try_from(degrees: i64) -> Result<Self, Self::Error> {
        Rotation::from_degrees(degrees)
            .ok_or_else(|| format!("rotation must be a multiple of 90, got {}", degrees))
    }
}

impl From<Rotation> for i64 {
    fn from(rotation: Rotation) -> Self {
        rotation.degrees()
    }
}

/// Native dimensions of a single page.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageDims {
    /// Media box width in points (unrotated).
    pub width: f64,
    /// Media box height in points (unrotated).
    pub height: f64,
    /// Display rotation.
    #[serde(default)]
    pub rotation: Rotation,
    /// Lower-left corner of the media box.
    #[serde(default)]
    pub origin_x: f64,
    #[serde(default)]
    pub origin_y: f64,
}

impl PageDims {
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            width,
            height,
            rotation: Rotation::Deg0,
            origin_x: 0.0,
            origin_y: 0.0,
        }
    }

    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_origin(mut self, x: f64, y: f64) -> Self {
        self.origin_x = x;
        self.origin_y = y;
        self
    }

    /// US Letter, portrait.
    pub fn letter() -> Self {
        Self::new(612.0, 792.0)
    }

    /// The media box in page space.
    pub fn media_box(&self) -> Rect {
        Rect::new(
            self.origin_x,
            self.origin_y,
            self.origin_x + self.width,
            self.origin_y + self.height,
        )
    }

    /// Page size as shown to the user (width and height swap when sideways).
    pub fn displayed_size(&self) -> Size {
        if self.rotation.is_sideways() {
            Size::new(self.height, self.width)
        } else {
            Size::new(self.width, self.height)
        }
    }

    fn is_valid(&self) -> bool {
        self.width.is_finite() && self.height.is_finite() && self.width > 0.0 && self.height > 0.0
    }

    /// Native normalized coordinates to page space (flips y).
    fn native_to_page(&self) -> Affine {
        Affine::new([
            self.width,
            0.0,
            0.0,
            -self.height,
            self.origin_x,
            self.origin_y + self.height,
        ])
    }

    /// Page space to native normalized coordinates.
    fn page_to_native(&self) -> Affine {
        Affine::new([
            1.0 / self.width,
            0.0,
            0.0,
            -1.0 / self.height,
            -self.origin_x / self.width,
            (self.origin_y + self.height) / self.height,
        ])
    }

    /// Transform from displayed normalized coordinates to page space.
    pub fn display_to_page(&self) -> Affine {
        self.native_to_page() * self.rotation.display_to_native()
    }

    /// Transform from page space to displayed normalized coordinates.
    pub fn page_to_display(&self) -> Affine {
        self.rotation.native_to_display() * self.page_to_native()
    }
}

/// A rect expressed as fractions of the displayed page (top-left origin).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl NormalizedRect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    /// As a kurbo rect in displayed normalized space.
    pub fn to_rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.x + self.width, self.y + self.height)
    }

    pub fn from_rect(rect: Rect) -> Self {
        let rect = rect.abs();
        Self::new(rect.x0, rect.y0, rect.width(), rect.height())
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.width.is_finite() && self.height.is_finite()
    }

    /// Whether the rect has a positive, finite area.
    pub fn is_degenerate(&self) -> bool {
        !self.is_finite() || self.width <= 0.0 || self.height <= 0.0
    }

    /// Whether the rect lies inside the unit square (within [`EPSILON`]).
    pub fn is_within_unit(&self) -> bool {
        contains_within(Rect::new(0.0, 0.0, 1.0, 1.0), self.to_rect(), EPSILON)
    }

    /// Component-wise comparison within `epsilon`.
    pub fn approx_eq(&self, other: &NormalizedRect, epsilon: f64) -> bool {
        (self.x - other.x).abs() <= epsilon
            && (self.y - other.y).abs() <= epsilon
            && (self.width - other.width).abs() <= epsilon
            && (self.height - other.height).abs() <= epsilon
    }
}

/// Placement failures. Callers must reject the placement, never clip it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OutOfBoundsError {
    #[error("rect {rect:?} extends outside page bounds {page:?}")]
    OutsidePage { rect: Rect, page: Rect },
    #[error("rect must have a positive, finite size")]
    Degenerate,
    #[error("page dimensions {width}x{height} are invalid")]
    InvalidPage { width: f64, height: f64 },
    #[error("page index {page_index} is out of range for a {page_count}-page document")]
    PageOutOfRange { page_index: usize, page_count: usize },
}

fn contains_within(outer: Rect, inner: Rect, tolerance: f64) -> bool {
    inner.x0 >= outer.x0 - tolerance
        && inner.y0 >= outer.y0 - tolerance
        && inner.x1 <= outer.x1 + tolerance
        && inner.y1 <= outer.y1 + tolerance
}

fn check_page(dims: &PageDims) -> Result<(), OutOfBoundsError> {
    if dims.is_valid() {
        Ok(())
    } else {
        Err(OutOfBoundsError::InvalidPage {
            width: dims.width,
            height: dims.height,
        })
    }
}

/// Map a normalized rect into page space.
pub fn to_page_space(rect: &NormalizedRect, dims: &PageDims) -> Result<Rect, OutOfBoundsError> {
    check_page(dims)?;
    if rect.is_degenerate() {
        return Err(OutOfBoundsError::Degenerate);
    }

    let page_rect = dims.display_to_page().transform_rect_bbox(rect.to_rect());
    let page = dims.media_box();
    let tolerance = EPSILON * dims.width.max(dims.height);
    if !contains_within(page, page_rect, tolerance) {
        return Err(OutOfBoundsError::OutsidePage {
            rect: page_rect,
            page,
        });
    }
    Ok(page_rect)
}

/// Map a page-space rect back to normalized displayed coordinates.
pub fn to_normalized(page_rect: Rect, dims: &PageDims) -> Result<NormalizedRect, OutOfBoundsError> {
    check_page(dims)?;
    let page_rect = page_rect.abs();
    let page = dims.media_box();
    let tolerance = EPSILON * dims.width.max(dims.height);
    if !contains_within(page, page_rect, tolerance) {
        return Err(OutOfBoundsError::OutsidePage {
            rect: page_rect,
            page,
        });
    }

    let normalized = NormalizedRect::from_rect(dims.page_to_display().transform_rect_bbox(page_rect));
    if normalized.is_degenerate() {
        return Err(OutOfBoundsError::Degenerate);
    }
    Ok(normalized)
}

/// An upright drawing frame for a field.
///
/// Local coordinates are in points with the origin at the bottom-left corner
/// of the field as the user sees it and y growing upwards. `to_page` maps them
/// into page space, so content drawn in the frame appears upright on rotated
/// pages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldFrame {
    /// Field width in points along the displayed x axis.
    pub width: f64,
    /// Field height in points along the displayed y axis.
    pub height: f64,
    /// Local frame to page space.
    pub to_page: Affine,
}

impl FieldFrame {
    /// Build the frame for a normalized rect on a page.
    pub fn new(rect: &NormalizedRect, dims: &PageDims) -> Result<Self, OutOfBoundsError> {
        // Validates bounds as a side effect.
        to_page_space(rect, dims)?;

        let display_to_page = dims.display_to_page();
        let bottom_left = display_to_page * Point::new(rect.x, rect.y + rect.height);
        let bottom_right = display_to_page * Point::new(rect.x + rect.width, rect.y + rect.height);
        let top_left = display_to_page * Point::new(rect.x, rect.y);

        let x_axis: Vec2 = bottom_right - bottom_left;
        let y_axis: Vec2 = top_left - bottom_left;
        let width = x_axis.hypot();
        let height = y_axis.hypot();
        if width <= 0.0 || height <= 0.0 {
            return Err(OutOfBoundsError::Degenerate);
        }

        let ex = x_axis / width;
        let ey = y_axis / height;
        Ok(Self {
            width,
            height,
            to_page: Affine::new([ex.x, ex.y, ey.x, ey.y, bottom_left.x, bottom_left.y]),
        })
    }

    /// Matrix that maps the unit square onto the field (for image XObjects).
    pub fn unit_square_matrix(&self) -> Affine {
        self.to_page * Affine::scale_non_uniform(self.width, self.height)
    }

    /// Bounding box of the field in page space.
    pub fn page_rect(&self) -> Rect {
        self.to_page
            .transform_rect_bbox(Rect::new(0.0, 0.0, self.width, self.height))
    }
}

/// A page as laid out on screen at some zoom level.
///
/// UI clients report field positions in pixels relative to the top-left of
/// the rendered page; the viewport converts them to normalized coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageViewport {
    /// Rendered page size in pixels.
    pub size: Size,
}

impl PageViewport {
    pub fn new(size: Size) -> Self {
        Self { size }
    }

    /// Viewport for a page rendered at `zoom` (1.0 = one pixel per point).
    pub fn for_page(dims: &PageDims, zoom: f64) -> Self {
        let displayed = dims.displayed_size();
        Self::new(Size::new(displayed.width * zoom, displayed.height * zoom))
    }

    /// Pixel space to normalized space.
    pub fn inverse_transform(&self) -> Affine {
        Affine::scale_non_uniform(1.0 / self.size.width, 1.0 / self.size.height)
    }

    /// Normalized space to pixel space.
    pub fn transform(&self) -> Affine {
        Affine::scale_non_uniform(self.size.width, self.size.height)
    }

    /// Convert a pixel rect to a normalized rect.
    pub fn normalize(&self, pixel_rect: Rect) -> NormalizedRect {
        NormalizedRect::from_rect(self.inverse_transform().transform_rect_bbox(pixel_rect))
    }

    /// Convert a normalized rect to pixels.
    pub fn to_pixels(&self, rect: &NormalizedRect) -> Rect {
        self.transform().transform_rect_bbox(rect.to_rect())
    }
}
