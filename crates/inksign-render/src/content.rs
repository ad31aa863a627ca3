//! PDF content stream construction on top of lopdf's [`Content`].
//!
//! Coordinates are rounded to four decimals so the same drawing always
//! encodes to the same bytes.

use inksign_core::RenderError;
use kurbo::{Affine, Point};
use lopdf::Object;
use lopdf::content::{Content, Operation};
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

/// The standard 14 fonts used for overlays. No font files are embedded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StandardFont {
    Helvetica,
    HelveticaBold,
    TimesItalic,
}

impl StandardFont {
    pub fn base_font(self) -> &'static str {
        match self {
            StandardFont::Helvetica => "Helvetica",
            StandardFont::HelveticaBold => "Helvetica-Bold",
            StandardFont::TimesItalic => "Times-Italic",
        }
    }

    /// Average advance width as a fraction of the font size.
    pub fn average_advance(self) -> f64 {
        match self {
            StandardFont::Helvetica => 0.52,
            StandardFont::HelveticaBold => 0.56,
            StandardFont::TimesItalic => 0.44,
        }
    }

    /// Estimated width of `text` at `size` points.
    pub fn estimate_width(self, text: &str, size: f64) -> f64 {
        text.chars().count() as f64 * self.average_advance() * size
    }
}

/// A single line of text positioned in some local frame.
#[derive(Debug, Clone, PartialEq)]
pub struct TextRun {
    pub text: String,
    pub font: StandardFont,
    pub size: f64,
    pub x: f64,
    pub baseline: f64,
}

impl TextRun {
    pub fn new(text: impl Into<String>, font: StandardFont, size: f64, x: f64, baseline: f64) -> Self {
        Self {
            text: text.into(),
            font,
            size,
            x,
            baseline,
        }
    }

    /// Size the text to a `width` x `height` box (y up), vertically centered.
    /// `centered` also centers it horizontally; otherwise it starts at `inset`.
    pub fn fit(text: &str, font: StandardFont, width: f64, height: f64, inset: f64, centered: bool) -> Self {
        let chars = text.chars().count().max(1) as f64;
        let usable = (width - 2.0 * inset).max(1.0);
        let size = (height * 0.72)
            .min(usable / (chars * font.average_advance()))
            .max(1.0);
        let text_width = font.estimate_width(text, size);
        let x = if centered {
            ((width - text_width) / 2.0).max(0.0)
        } else {
            inset
        };
        // Visible glyphs span roughly -0.2em..0.66em around the baseline.
        let baseline = height / 2.0 - 0.23 * size;
        Self::new(text, font, size, x, baseline)
    }
}

/// A content-stream number.
fn real(value: f64) -> Object {
    let rounded = if value.is_finite() {
        (value * 10_000.0).round() / 10_000.0
    } else {
        0.0
    };
    // -0 would print as "-0".
    Object::Real(if rounded == 0.0 { 0.0 } else { rounded as f32 })
}

fn name(resource: &str) -> Object {
    Object::Name(resource.as_bytes().to_vec())
}

/// The WinAnsi byte for `c`, if it has one.
fn win_ansi_byte(c: char) -> Option<u8> {
    match c {
        '\n' | '\r' | '\t' => Some(b' '),
        ' '..='~' | '\u{a0}'..='\u{ff}' => Some(c as u32 as u8),
        '\u{20ac}' => Some(0x80),
        '\u{2026}' => Some(0x85),
        '\u{2018}' => Some(0x91),
        '\u{2019}' => Some(0x92),
        '\u{201c}' => Some(0x93),
        '\u{201d}' => Some(0x94),
        '\u{2022}' => Some(0x95),
        '\u{2013}' => Some(0x96),
        '\u{2014}' => Some(0x97),
        '\u{2122}' => Some(0x99),
        _ => None,
    }
}

/// Encode text for the standard fonts (WinAnsiEncoding).
///
/// Characters the encoding lacks are folded to their base letters when
/// Unicode decomposes them (`ř` becomes `r`, `ﬁ` becomes `fi`). Anything
/// else, such as CJK or Cyrillic, becomes `?`.
pub fn win_ansi(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    for c in text.nfc() {
        if let Some(byte) = win_ansi_byte(c) {
            out.push(byte);
            continue;
        }
        let folded: Option<Vec<u8>> = std::iter::once(c)
            .nfkd()
            .filter(|d| !is_combining_mark(*d))
            .map(win_ansi_byte)
            .collect();
        match folded {
            Some(bytes) if !bytes.is_empty() => out.extend(bytes),
            _ => out.push(b'?'),
        }
    }
    out
}

/// Accumulates content stream operations.
#[derive(Debug, Default, Clone)]
pub struct ContentBuilder {
    operations: Vec<Operation>,
}

impl ContentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    fn op(&mut self, operator: &str, operands: Vec<Object>) -> &mut Self {
        self.operations.push(Operation::new(operator, operands));
        self
    }

    pub fn save(&mut self) -> &mut Self {
        self.op("q", vec![])
    }

    pub fn restore(&mut self) -> &mut Self {
        self.op("Q", vec![])
    }

    /// Concatenate `affine` onto the current transformation matrix.
    pub fn transform(&mut self, affine: Affine) -> &mut Self {
        let operands = affine.as_coeffs().into_iter().map(real).collect();
        self.op("cm", operands)
    }

    pub fn draw_xobject(&mut self, resource: &str) -> &mut Self {
        self.op("Do", vec![name(resource)])
    }

    pub fn fill_rgb(&mut self, rgb: [u8; 3]) -> &mut Self {
        let operands = rgb.iter().map(|&c| real(c as f64 / 255.0)).collect();
        self.op("rg", operands)
    }

    pub fn stroke_rgb(&mut self, rgb: [u8; 3]) -> &mut Self {
        let operands = rgb.iter().map(|&c| real(c as f64 / 255.0)).collect();
        self.op("RG", operands)
    }

    pub fn line_width(&mut self, width: f64) -> &mut Self {
        self.op("w", vec![real(width)])
    }

    /// Round caps and joins.
    pub fn round_lines(&mut self) -> &mut Self {
        self.op("J", vec![Object::Integer(1)]).op("j", vec![Object::Integer(1)])
    }

    /// Stroke an open polyline.
    pub fn polyline(&mut self, points: &[Point]) -> &mut Self {
        let Some((first, rest)) = points.split_first() else {
            return self;
        };
        self.op("m", vec![real(first.x), real(first.y)]);
        for p in rest {
            self.op("l", vec![real(p.x), real(p.y)]);
        }
        self.op("S", vec![])
    }

    /// Show a text run using a font resource name.
    pub fn text(&mut self, font_resource: &str, run: &TextRun) -> &mut Self {
        self.op("BT", vec![])
            .op("Tf", vec![name(font_resource), real(run.size)])
            .op("Td", vec![real(run.x), real(run.baseline)])
            .op("Tj", vec![Object::string_literal(win_ansi(&run.text))])
            .op("ET", vec![])
    }

    pub fn finish(self) -> Result<Vec<u8>, RenderError> {
        Content {
            operations: self.operations,
        }
        .encode()
        .map_err(|e| RenderError::Encode(format!("content stream: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operators(content: &ContentBuilder) -> Vec<&str> {
        content.operations().iter().map(|op| op.operator.as_str()).collect()
    }

    #[test]
    fn test_real_rounding() {
        assert!(matches!(real(1.0), Object::Real(v) if v == 1.0));
        assert!(matches!(real(612.123456), Object::Real(v) if (v - 612.1235).abs() < 1e-3));
        assert!(matches!(real(-0.00001), Object::Real(v) if v == 0.0 && v.is_sign_positive()));
        assert!(matches!(real(f64::NAN), Object::Real(v) if v == 0.0));
    }

    #[test]
    fn test_win_ansi_encoding() {
        assert_eq!(win_ansi("Zoë"), vec![b'Z', b'o', 0xEB]);
        assert_eq!(win_ansi("O\u{2019}Brien"), vec![b'O', 0x92, b'B', b'r', b'i', b'e', b'n']);
        assert_eq!(win_ansi("Dvořák"), vec![b'D', b'v', b'o', b'r', 0xE1, b'k']);
        assert_eq!(win_ansi("\u{fb01}n"), b"fin".to_vec());
        assert_eq!(win_ansi("李 Ли"), b"? ??".to_vec());
        // Decomposed input is composed before encoding.
        assert_eq!(win_ansi("e\u{301}"), vec![0xE9]);
    }

    #[test]
    fn test_builder_output() {
        let mut content = ContentBuilder::new();
        content
            .save()
            .transform(Affine::new([1.0, 0.0, 0.0, 1.0, 72.0, 144.5]))
            .draw_xobject("Im0")
            .restore();
        assert_eq!(operators(&content), vec!["q", "cm", "Do", "Q"]);
        let text = String::from_utf8(content.finish().unwrap()).unwrap();
        assert_eq!(text, "q\n1 0 0 1 72 144.5 cm\n/Im0 Do\nQ");
    }

    #[test]
    fn test_text_run_fits_box() {
        let run = TextRun::fit("Ada Lovelace", StandardFont::TimesItalic, 150.0, 40.0, 2.0, true);
        assert!(run.size <= 40.0 * 0.72 + 1e-9);
        let width = StandardFont::TimesItalic.estimate_width(&run.text, run.size);
        assert!(width <= 150.0);
        assert!(run.x >= 0.0 && run.x + width <= 150.0 + 1e-9);

        // A long name is limited by width instead of height.
        let long = TextRun::fit(&"x".repeat(80), StandardFont::Helvetica, 100.0, 40.0, 2.0, false);
        assert!(long.size < 10.0);
        assert_eq!(long.x, 2.0);
    }

    #[test]
    fn test_text_decodes_back() {
        let mut content = ContentBuilder::new();
        content.text("F1", &TextRun::new("Hi (a)\\b) Zoë", StandardFont::Helvetica, 8.0, 0.0, -10.0));
        assert_eq!(operators(&content), vec!["BT", "Tf", "Td", "Tj", "ET"]);

        let decoded = Content::decode(&content.finish().unwrap()).unwrap();
        let ops: Vec<_> = decoded.operations.iter().map(|op| op.operator.as_str()).collect();
        assert_eq!(ops, vec!["BT", "Tf", "Td", "Tj", "ET"]);
        assert_eq!(decoded.operations[1].operands[0].as_name().unwrap(), b"F1");
        assert_eq!(decoded.operations[1].operands[1].as_float().unwrap(), 8.0);
        assert_eq!(decoded.operations[2].operands[1].as_float().unwrap(), -10.0);
        assert_eq!(
            decoded.operations[3].operands[0].as_str().unwrap(),
            &win_ansi("Hi (a)\\b) Zoë")[..]
        );
    }

    #[test]
    fn test_polyline_strokes_every_point() {
        let mut content = ContentBuilder::new();
        content.polyline(&[Point::new(0.0, 0.0), Point::new(1.5, 2.0), Point::new(3.0, 0.25)]);
        assert_eq!(operators(&content), vec!["m", "l", "l", "S"]);
        content.polyline(&[]);
        assert_eq!(content.operations().len(), 4);
    }
}
