//! Signature rasterization.
//!
//! Drawn strokes and uploaded images become a transparent RGBA bitmap sized to
//! the field; typed names become a line of italic lettering. Everything here is
//! a pure function of its inputs.

use crate::content::{StandardFont, TextRun};
use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_antialiased_line_segment_mut, draw_filled_circle_mut};
use inksign_core::stroke::strokes_bounds;
use inksign_core::{RenderError, SignatureInput, Stroke};
use kurbo::{Affine, Point, Vec2};

/// Rasterizer settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterOptions {
    /// Bitmap resolution relative to the field size in points.
    pub pixels_per_point: f64,
    /// Pen width in points.
    pub stroke_width: f64,
    /// Ink color.
    pub ink: [u8; 3],
    /// Longest bitmap side in pixels.
    pub max_dimension: u32,
    /// Margin around the signature as a fraction of the shorter side.
    pub padding: f64,
}

impl Default for RasterOptions {
    fn default() -> Self {
        Self {
            pixels_per_point: 3.0,
            stroke_width: 1.4,
            ink: [18, 32, 92],
            max_dimension: 2048,
            padding: 0.06,
        }
    }
}

/// What gets drawn into a signature field.
#[derive(Debug, Clone, PartialEq)]
pub enum SignatureMark {
    Bitmap(RgbaImage),
    /// Typed name in field-local points (origin bottom-left, y up).
    Lettering(TextRun),
}

/// Bitmap size for a field of `width` x `height` points.
pub fn canvas_size(width: f64, height: f64, options: &RasterOptions) -> (u32, u32) {
    let mut w = (width * options.pixels_per_point).round().max(1.0);
    let mut h = (height * options.pixels_per_point).round().max(1.0);
    let largest = w.max(h);
    let limit = options.max_dimension.max(1) as f64;
    if largest > limit {
        let s = limit / largest;
        w = (w * s).round().max(1.0);
        h = (h * s).round().max(1.0);
    }
    (w as u32, h as u32)
}

/// Build the mark for a signature input filling a `width` x `height` field.
pub fn mark_for(
    input: &SignatureInput,
    width: f64,
    height: f64,
    options: &RasterOptions,
) -> Result<SignatureMark, RenderError> {
    match input {
        SignatureInput::Drawn { strokes } => {
            rasterize_strokes(strokes, width, height, options).map(SignatureMark::Bitmap)
        }
        SignatureInput::Image { .. } => {
            let data = input
                .image_data()
                .ok_or_else(|| RenderError::Raster("signature image is not valid base64".to_string()))?;
            rasterize_image(&data, width, height, options).map(SignatureMark::Bitmap)
        }
        SignatureInput::Typed { name } => Ok(SignatureMark::Lettering(TextRun::fit(
            name,
            StandardFont::TimesItalic,
            width,
            height,
            width * options.padding,
            true,
        ))),
    }
}

/// Keep the ink color, take the stronger coverage.
fn ink_blend(line: Rgba<u8>, original: Rgba<u8>, weight: f32) -> Rgba<u8> {
    let coverage = (weight.clamp(0.0, 1.0) * line[3] as f32).round() as u8;
    Rgba([line[0], line[1], line[2], original[3].max(coverage)])
}

fn to_pixel(p: Point) -> (i32, i32) {
    (p.x.round() as i32, p.y.round() as i32)
}

/// Draw a segment `width` pixels wide as a bundle of anti-aliased hairlines.
fn draw_thick_segment(image: &mut RgbaImage, from: Point, to: Point, width: f64, color: Rgba<u8>) {
    let direction = to - from;
    let length = direction.hypot();
    let normal = if length > f64::EPSILON {
        Vec2::new(-direction.y / length, direction.x / length)
    } else {
        Vec2::ZERO
    };
    let radius = width / 2.0;
    let steps = (radius * 2.0).ceil() as i32;
    for i in -steps..=steps {
        let offset = i as f64 * 0.5;
        if offset.abs() > radius {
            continue;
        }
        let shift = normal * offset;
        draw_antialiased_line_segment_mut(
            image,
            to_pixel(from + shift),
            to_pixel(to + shift),
            color,
            ink_blend,
        );
    }
}

fn draw_polyline(image: &mut RgbaImage, points: &[Point], width: f64, color: Rgba<u8>) {
    for pair in points.windows(2) {
        draw_thick_segment(image, pair[0], pair[1], width, color);
    }
    // Round joins, and dots for single-point strokes.
    let radius = (width / 2.0 - 0.5).max(0.0).round() as i32;
    for &point in points {
        draw_filled_circle_mut(image, to_pixel(point), radius, color);
    }
}

/// Rasterize strokes with uniform scale, centered in the field.
pub fn rasterize_strokes(
    strokes: &[Stroke],
    width: f64,
    height: f64,
    options: &RasterOptions,
) -> Result<RgbaImage, RenderError> {
    let bounds = strokes_bounds(strokes).ok_or_else(|| RenderError::Raster("signature has no strokes".to_string()))?;
    let (w, h) = canvas_size(width, height, options);
    let mut image = RgbaImage::new(w, h);

    let px_per_pt = w as f64 / width.max(f64::EPSILON);
    let line = (options.stroke_width * px_per_pt).max(1.0);
    let pad = options.padding * w.min(h) as f64 + line / 2.0;
    let avail_w = (w as f64 - 2.0 * pad).max(1.0);
    let avail_h = (h as f64 - 2.0 * pad).max(1.0);

    let sx = if bounds.width() > f64::EPSILON { avail_w / bounds.width() } else { f64::INFINITY };
    let sy = if bounds.height() > f64::EPSILON { avail_h / bounds.height() } else { f64::INFINITY };
    let scale = match sx.min(sy) {
        s if s.is_finite() => s,
        _ => 1.0,
    };
    let offset = Vec2::new(
        (w as f64 - bounds.width() * scale) / 2.0 - bounds.x0 * scale,
        (h as f64 - bounds.height() * scale) / 2.0 - bounds.y0 * scale,
    );
    let to_canvas = Affine::translate(offset) * Affine::scale(scale);

    let [r, g, b] = options.ink;
    let color = Rgba([r, g, b, 255]);
    for stroke in strokes.iter().filter(|s| !s.is_empty()) {
        // Drop detail finer than half an output pixel.
        let points: Vec<Point> = stroke
            .simplified(0.5 / scale)
            .points
            .iter()
            .map(|p| to_canvas * p.point())
            .collect();
        draw_polyline(&mut image, &points, line, color);
    }
    Ok(image)
}

/// Decode an image and fit it, aspect preserved, into the field.
pub fn rasterize_image(
    data: &[u8],
    width: f64,
    height: f64,
    options: &RasterOptions,
) -> Result<RgbaImage, RenderError> {
    let decoded = image::load_from_memory(data)
        .map_err(|e| RenderError::Raster(format!("cannot decode signature image: {}", e)))?
        .to_rgba8();
    let (iw, ih) = decoded.dimensions();
    if iw == 0 || ih == 0 {
        return Err(RenderError::Raster("signature image is empty".to_string()));
    }

    let (w, h) = canvas_size(width, height, options);
    let pad = options.padding * w.min(h) as f64;
    let avail_w = (w as f64 - 2.0 * pad).max(1.0);
    let avail_h = (h as f64 - 2.0 * pad).max(1.0);
    let scale = (avail_w / iw as f64).min(avail_h / ih as f64);
    let nw = ((iw as f64 * scale).round() as u32).clamp(1, w);
    let nh = ((ih as f64 * scale).round() as u32).clamp(1, h);

    let resized = imageops::resize(&decoded, nw, nh, FilterType::Triangle);
    let mut canvas = RgbaImage::new(w, h);
    imageops::overlay(&mut canvas, &resized, ((w - nw) / 2) as i64, ((h - nh) / 2) as i64);
    Ok(canvas)
}

/// Encode an RGBA bitmap as PNG.
pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>, RenderError> {
    let mut png_data = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut png_data, image.width(), image.height());
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);

        let mut writer = encoder
            .write_header()
            .map_err(|e| RenderError::Encode(format!("PNG header: {}", e)))?;
        writer
            .write_image_data(image.as_raw())
            .map_err(|e| RenderError::Encode(format!("PNG data: {}", e)))?;
    }
    Ok(png_data)
}

/// Preview of a signature at a given field size, as PNG. Typed names have no
/// bitmap form and yield `None`.
pub fn preview_png(
    input: &SignatureInput,
    width: f64,
    height: f64,
    options: &RasterOptions,
) -> Result<Option<Vec<u8>>, RenderError> {
    match mark_for(input, width, height, options)? {
        SignatureMark::Bitmap(image) => encode_png(&image).map(Some),
        SignatureMark::Lettering(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{Engine, engine::general_purpose::STANDARD};
    use inksign_core::ImageFormat;

    fn zigzag() -> Vec<Stroke> {
        vec![
            Stroke::from_xy(&[(10.0, 40.0), (30.0, 10.0), (50.0, 40.0), (70.0, 10.0)]),
            Stroke::from_xy(&[(15.0, 50.0), (65.0, 50.0)]),
        ]
    }

    fn inked(image: &RgbaImage) -> Vec<(u32, u32)> {
        image
            .enumerate_pixels()
            .filter(|(_, _, p)| p[3] > 0)
            .map(|(x, y, _)| (x, y))
            .collect()
    }

    #[test]
    fn test_canvas_size_respects_limit() {
        let options = RasterOptions::default();
        assert_eq!(canvas_size(100.0, 30.0, &options), (300, 90));
        let small = RasterOptions {
            max_dimension: 150,
            ..RasterOptions::default()
        };
        assert_eq!(canvas_size(100.0, 30.0, &small), (150, 45));
    }

    #[test]
    fn test_strokes_are_fitted_and_centered() {
        let options = RasterOptions::default();
        let image = rasterize_strokes(&zigzag(), 120.0, 40.0, &options).unwrap();
        assert_eq!(image.dimensions(), (360, 120));

        let pixels = inked(&image);
        assert!(!pixels.is_empty());
        let min_x = pixels.iter().map(|p| p.0).min().unwrap() as i64;
        let max_x = pixels.iter().map(|p| p.0).max().unwrap() as i64;
        let min_y = pixels.iter().map(|p| p.1).min().unwrap() as i64;
        let max_y = pixels.iter().map(|p| p.1).max().unwrap() as i64;

        // The signature is height-limited, so it is centered horizontally.
        let left = min_x;
        let right = 359 - max_x;
        assert!((left - right).abs() <= 4, "left {} right {}", left, right);
        // Vertically it fills the field up to the padding.
        assert!(min_y < 20 && max_y > 100);
        // Corners stay transparent.
        assert_eq!(image.get_pixel(0, 0)[3], 0);
        assert_eq!(image.get_pixel(359, 119)[3], 0);
    }

    #[test]
    fn test_ink_color_is_used() {
        let options = RasterOptions::default();
        let image = rasterize_strokes(&zigzag(), 120.0, 40.0, &options).unwrap();
        let opaque = image.pixels().find(|p| p[3] == 255).unwrap();
        assert_eq!([opaque[0], opaque[1], opaque[2]], options.ink);
    }

    #[test]
    fn test_rasterization_is_deterministic() {
        let options = RasterOptions::default();
        let a = rasterize_strokes(&zigzag(), 90.0, 30.0, &options).unwrap();
        let b = rasterize_strokes(&zigzag(), 90.0, 30.0, &options).unwrap();
        assert_eq!(a, b);
        assert_eq!(encode_png(&a).unwrap(), encode_png(&b).unwrap());
    }

    #[test]
    fn test_single_dot_signature() {
        let strokes = vec![Stroke::from_xy(&[(5.0, 5.0)])];
        let image = rasterize_strokes(&strokes, 30.0, 30.0, &RasterOptions::default()).unwrap();
        let pixels = inked(&image);
        assert!(!pixels.is_empty());
        assert!(pixels.contains(&(45, 45)));
    }

    #[test]
    fn test_empty_strokes_rejected() {
        let result = rasterize_strokes(&[], 30.0, 30.0, &RasterOptions::default());
        assert!(matches!(result, Err(RenderError::Raster(_))));
    }

    #[test]
    fn test_image_signature_is_fitted() {
        let mut source = RgbaImage::new(20, 10);
        for pixel in source.pixels_mut() {
            *pixel = Rgba([0, 0, 0, 255]);
        }
        let png = encode_png(&source).unwrap();
        assert_eq!(ImageFormat::from_magic_bytes(&png), Some(ImageFormat::Png));

        let options = RasterOptions {
            padding: 0.0,
            ..RasterOptions::default()
        };
        // 2:1 image into a 4:1 field: full height, centered horizontally.
        let image = rasterize_image(&png, 40.0, 10.0, &options).unwrap();
        assert_eq!(image.dimensions(), (120, 30));
        assert_eq!(image.get_pixel(60, 15)[3], 255);
        assert_eq!(image.get_pixel(5, 15)[3], 0);
    }

    #[test]
    fn test_mark_for_inputs() {
        let options = RasterOptions::default();
        let typed = SignatureInput::Typed {
            name: "Ada Lovelace".to_string(),
        };
        match mark_for(&typed, 150.0, 40.0, &options).unwrap() {
            SignatureMark::Lettering(run) => {
                assert_eq!(run.font, StandardFont::TimesItalic);
                assert_eq!(run.text, "Ada Lovelace");
            }
            other => panic!("unexpected mark {:?}", other),
        }

        let broken = SignatureInput::Image {
            format: ImageFormat::Png,
            data_base64: STANDARD.encode(b"\x89PNG but not really"),
        };
        assert!(matches!(
            mark_for(&broken, 150.0, 40.0, &options),
            Err(RenderError::Raster(_))
        ));

        let drawn = SignatureInput::Drawn { strokes: zigzag() };
        let preview = preview_png(&drawn, 60.0, 20.0, &options).unwrap().unwrap();
        assert_eq!(ImageFormat::from_magic_bytes(&preview), Some(ImageFormat::Png));
        assert!(preview_png(&typed, 60.0, 20.0, &options).unwrap().is_none());
    }
}
