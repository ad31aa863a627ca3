//! Field definitions and per-kind value validation.

use crate::envelope::{EnvelopeId, SignerId};
use crate::geometry::NormalizedRect;
use crate::stroke::Stroke;
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Unique field identifier.
pub type FieldId = Uuid;

/// The closed set of field kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    Signature,
    Initial,
    Date,
    Text {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_length: Option<usize>,
    },
    Checkbox,
}

impl FieldKind {
    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::Signature => "signature",
            FieldKind::Initial => "initial",
            FieldKind::Date => "date",
            FieldKind::Text { .. } => "text",
            FieldKind::Checkbox => "checkbox",
        }
    }

    /// Signature-like fields carry an audit stamp when rendered.
    pub fn is_signature(&self) -> bool {
        matches!(self, FieldKind::Signature | FieldKind::Initial)
    }
}

/// Image format of an uploaded signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
}

impl ImageFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
        }
    }

    pub fn from_mime_type(mime: &str) -> Option<Self> {
        match mime.trim().to_ascii_lowercase().as_str() {
            "image/png" => Some(ImageFormat::Png),
            "image/jpeg" | "image/jpg" => Some(ImageFormat::Jpeg),
            _ => None,
        }
    }

    fn codec(self) -> image::ImageFormat {
        match self {
            ImageFormat::Png => image::ImageFormat::Png,
            ImageFormat::Jpeg => image::ImageFormat::Jpeg,
        }
    }

    /// Detect format from magic bytes.
    pub fn from_magic_bytes(data: &[u8]) -> Option<Self> {
        // PNG: 89 50 4E 47
        if data.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
            return Some(ImageFormat::Png);
        }
        // JPEG: FF D8 FF
        if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some(ImageFormat::Jpeg);
        }
        None
    }
}

/// How a signature or initial was captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignatureInput {
    /// Pen strokes drawn on a pad.
    Drawn { strokes: Vec<Stroke> },
    /// A typed name rendered in a script face.
    Typed { name: String },
    /// An uploaded image of a signature.
    Image {
        format: ImageFormat,
        /// Base64 image bytes; kept as a string so envelopes stay plain JSON.
        data_base64: String,
    },
}

impl SignatureInput {
    /// Decoded image bytes for [`SignatureInput::Image`].
    pub fn image_data(&self) -> Option<Vec<u8>> {
        match self {
            SignatureInput::Image { data_base64, .. } => STANDARD.decode(data_base64).ok(),
            _ => None,
        }
    }
}

/// A validated field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Signature(SignatureInput),
    Date(NaiveDate),
    Text(String),
    Checkbox(bool),
}

impl FieldValue {
    /// Plain-text rendering for non-graphical values.
    pub fn display_text(&self) -> Option<String> {
        match self {
            FieldValue::Date(date) => Some(date.format("%Y-%m-%d").to_string()),
            FieldValue::Text(text) => Some(text.clone()),
            FieldValue::Checkbox(checked) => Some(if *checked { "Yes" } else { "No" }.to_string()),
            FieldValue::Signature(SignatureInput::Typed { name }) => Some(name.clone()),
            FieldValue::Signature(_) => None,
        }
    }
}

/// A value as submitted by a client, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Bool(bool),
    Text(String),
    Strokes(Vec<Stroke>),
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::Text(value.to_string())
    }
}

impl From<bool> for RawValue {
    fn from(value: bool) -> Self {
        RawValue::Bool(value)
    }
}

impl From<Vec<Stroke>> for RawValue {
    fn from(value: Vec<Stroke>) -> Self {
        RawValue::Strokes(value)
    }
}

/// Options for the audit stamp printed under a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StampOptions {
    pub include_name: bool,
    pub include_date: bool,
}

impl Default for StampOptions {
    fn default() -> Self {
        Self {
            include_name: true,
            include_date: true,
        }
    }
}

/// A placed field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub id: FieldId,
    pub envelope_id: EnvelopeId,
    pub kind: FieldKind,
    /// Zero-based page index.
    pub page_index: usize,
    pub rect: NormalizedRect,
    pub signer_id: SignerId,
    pub required: bool,
    #[serde(default)]
    pub stamp: StampOptions,
    /// Set exactly once by the assigned signer.
    pub value: Option<FieldValue>,
    pub filled_at: Option<DateTime<Utc>>,
}

impl Field {
    pub fn is_filled(&self) -> bool {
        self.value.is_some()
    }
}

/// A field placement request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Caller-chosen id; generated when absent.
    #[serde(default)]
    pub id: Option<FieldId>,
    pub kind: FieldKind,
    pub page_index: usize,
    pub rect: NormalizedRect,
    pub signer_id: SignerId,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub stamp: StampOptions,
}

fn default_required() -> bool {
    true
}

impl FieldSpec {
    /// A required field.
    pub fn new(kind: FieldKind, page_index: usize, rect: NormalizedRect, signer_id: SignerId) -> Self {
        Self {
            id: None,
            kind,
            page_index,
            rect,
            signer_id,
            required: true,
            stamp: StampOptions::default(),
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_id(mut self, id: FieldId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_stamp(mut self, stamp: StampOptions) -> Self {
        self.stamp = stamp;
        self
    }

    pub(crate) fn into_field(self, envelope_id: EnvelopeId) -> Field {
        Field {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            envelope_id,
            kind: self.kind,
            page_index: self.page_index,
            rect: self.rect,
            signer_id: self.signer_id,
            required: self.required,
            stamp: self.stamp,
            value: None,
            filled_at: None,
        }
    }
}

/// Minimums enforced by [`validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationRules {
    /// Strokes (with at least `min_points_per_stroke` points) a drawn signature needs.
    pub min_strokes: usize,
    pub min_points_per_stroke: usize,
    /// Characters a typed signature needs.
    pub min_signature_chars: usize,
    /// Characters typed initials need.
    pub min_initial_chars: usize,
    /// Applied to text fields that do not set their own maximum.
    pub default_text_max_length: Option<usize>,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            min_strokes: 1,
            min_points_per_stroke: 2,
            min_signature_chars: 2,
            min_initial_chars: 1,
            default_text_max_length: None,
        }
    }
}

/// Why a single value was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{kind} field expects {expected}")]
    WrongType {
        kind: &'static str,
        expected: &'static str,
    },
    #[error("drawn signature needs at least {min_strokes} stroke(s) of {min_points} or more points")]
    TooFewStrokes { min_strokes: usize, min_points: usize },
    #[error("stroke contains a non-finite coordinate")]
    NonFiniteStroke,
    #[error("value must be at least {min} characters, got {actual}")]
    TooShort { min: usize, actual: usize },
    #[error("value must be at most {max} characters, got {actual}")]
    TooLong { max: usize, actual: usize },
    #[error("required text is empty")]
    Empty,
    #[error("'{0}' is not an ISO-8601 calendar date (YYYY-MM-DD)")]
    InvalidDate(String),
    #[error("signature image must be a base64 PNG or JPEG data URL")]
    InvalidImage,
    #[error("data URL declares {declared} but carries {actual}")]
    ImageTypeMismatch {
        declared: &'static str,
        actual: &'static str,
    },
    #[error("signature image cannot be decoded: {0}")]
    UndecodableImage(String),
}

/// Validate a raw value for a field kind.
pub fn validate(
    kind: &FieldKind,
    required: bool,
    raw: &RawValue,
    rules: &ValidationRules,
) -> Result<FieldValue, ValidationError> {
    match kind {
        FieldKind::Signature => validate_signature(raw, rules.min_signature_chars, kind, rules),
        FieldKind::Initial => validate_signature(raw, rules.min_initial_chars, kind, rules),
        FieldKind::Date => validate_date(raw),
        FieldKind::Text { max_length } => {
            validate_text(raw, required, max_length.or(rules.default_text_max_length))
        }
        FieldKind::Checkbox => match raw {
            RawValue::Bool(checked) => Ok(FieldValue::Checkbox(*checked)),
            _ => Err(ValidationError::WrongType {
                kind: kind.name(),
                expected: "a boolean",
            }),
        },
    }
}

fn validate_signature(
    raw: &RawValue,
    min_chars: usize,
    kind: &FieldKind,
    rules: &ValidationRules,
) -> Result<FieldValue, ValidationError> {
    match raw {
        RawValue::Strokes(strokes) => {
            if !strokes.iter().all(Stroke::is_finite) {
                return Err(ValidationError::NonFiniteStroke);
            }
            let usable = strokes
                .iter()
                .filter(|s| s.len() >= rules.min_points_per_stroke)
                .count();
            if usable < rules.min_strokes.max(1) {
                return Err(ValidationError::TooFewStrokes {
                    min_strokes: rules.min_strokes.max(1),
                    min_points: rules.min_points_per_stroke,
                });
            }
            Ok(FieldValue::Signature(SignatureInput::Drawn {
                strokes: strokes.clone(),
            }))
        }
        RawValue::Text(text) if text.starts_with("data:") => parse_data_url(text).map(FieldValue::Signature),
        RawValue::Text(text) => {
            let name = text.trim();
            let actual = name.chars().count();
            if actual < min_chars.max(1) {
                return Err(ValidationError::TooShort {
                    min: min_chars.max(1),
                    actual,
                });
            }
            Ok(FieldValue::Signature(SignatureInput::Typed {
                name: name.to_string(),
            }))
        }
        RawValue::Bool(_) => Err(ValidationError::WrongType {
            kind: kind.name(),
            expected: "strokes, a typed name or an image data URL",
        }),
    }
}

/// Parse `data:image/png;base64,....` into an image signature. The declared
/// type must match the payload and the payload must decode.
fn parse_data_url(url: &str) -> Result<SignatureInput, ValidationError> {
    let (header, encoded) = url.split_once(',').ok_or(ValidationError::InvalidImage)?;
    let declared = header
        .strip_prefix("data:")
        .and_then(|h| h.strip_suffix(";base64"))
        .and_then(ImageFormat::from_mime_type)
        .ok_or(ValidationError::InvalidImage)?;
    let data = STANDARD
        .decode(encoded.trim())
        .map_err(|_| ValidationError::InvalidImage)?;
    let format = ImageFormat::from_magic_bytes(&data).ok_or(ValidationError::InvalidImage)?;
    if format != declared {
        return Err(ValidationError::ImageTypeMismatch {
            declared: declared.mime_type(),
            actual: format.mime_type(),
        });
    }
    let decoded = image::load_from_memory_with_format(&data, format.codec())
        .map_err(|e| ValidationError::UndecodableImage(e.to_string()))?;
    if decoded.width() == 0 || decoded.height() == 0 {
        return Err(ValidationError::UndecodableImage("image is empty".to_string()));
    }
    Ok(SignatureInput::Image {
        format,
        data_base64: STANDARD.encode(&data),
    })
}

fn validate_date(raw: &RawValue) -> Result<FieldValue, ValidationError> {
    match raw {
        RawValue::Text(text) => NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
            .map(FieldValue::Date)
            .map_err(|_| ValidationError::InvalidDate(text.clone())),
        _ => Err(ValidationError::WrongType {
            kind: "date",
            expected: "an ISO-8601 date string",
        }),
    }
}

fn validate_text(
    raw: &RawValue,
    required: bool,
    max_length: Option<usize>,
) -> Result<FieldValue, ValidationError> {
    let RawValue::Text(text) = raw else {
        return Err(ValidationError::WrongType {
            kind: "text",
            expected: "a string",
        });
    };
    if required && text.trim().is_empty() {
        return Err(ValidationError::Empty);
    }
    let actual = text.chars().count();
    if let Some(max) = max_length {
        if actual > max {
            return Err(ValidationError::TooLong { max, actual });
        }
    }
    Ok(FieldValue::Text(text.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // 1x1 transparent PNG.
    const TINY_PNG_B64: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

    fn rules() -> ValidationRules {
        ValidationRules::default()
    }

    #[test]
    fn test_drawn_signature() {
        let strokes = vec![Stroke::from_xy(&[(0.0, 0.0), (10.0, 5.0), (20.0, 0.0)])];
        let value = validate(&FieldKind::Signature, true, &strokes.clone().into(), &rules()).unwrap();
        assert_eq!(value, FieldValue::Signature(SignatureInput::Drawn { strokes }));
    }

    #[test]
    fn test_drawn_signature_needs_enough_points() {
        let strokes = vec![Stroke::from_xy(&[(0.0, 0.0)])];
        let result = validate(&FieldKind::Signature, true, &strokes.into(), &rules());
        assert!(matches!(result, Err(ValidationError::TooFewStrokes { .. })));

        let result = validate(&FieldKind::Signature, true, &RawValue::Strokes(vec![]), &rules());
        assert!(matches!(result, Err(ValidationError::TooFewStrokes { .. })));
    }

    #[test]
    fn test_stroke_minimum_is_configurable() {
        let rules = ValidationRules {
            min_strokes: 2,
            ..ValidationRules::default()
        };
        let strokes = vec![Stroke::from_xy(&[(0.0, 0.0), (1.0, 1.0)])];
        let result = validate(&FieldKind::Signature, true, &strokes.into(), &rules);
        assert_eq!(
            result,
            Err(ValidationError::TooFewStrokes {
                min_strokes: 2,
                min_points: 2
            })
        );
    }

    #[test]
    fn test_non_finite_stroke_rejected() {
        let strokes = vec![Stroke::from_xy(&[(0.0, 0.0), (f64::NAN, 1.0)])];
        let result = validate(&FieldKind::Initial, true, &strokes.into(), &rules());
        assert_eq!(result, Err(ValidationError::NonFiniteStroke));
    }

    #[test]
    fn test_typed_signature_length() {
        let value = validate(&FieldKind::Signature, true, &"  Ada Lovelace ".into(), &rules()).unwrap();
        assert_eq!(
            value,
            FieldValue::Signature(SignatureInput::Typed {
                name: "Ada Lovelace".to_string()
            })
        );

        let result = validate(&FieldKind::Signature, true, &"A".into(), &rules());
        assert_eq!(result, Err(ValidationError::TooShort { min: 2, actual: 1 }));

        // Initials accept a single character.
        assert!(validate(&FieldKind::Initial, true, &"A".into(), &rules()).is_ok());
    }

    #[test]
    fn test_image_signature() {
        let url = format!("data:image/png;base64,{}", TINY_PNG_B64);
        let value = validate(&FieldKind::Signature, true, &url.as_str().into(), &rules()).unwrap();
        match value {
            FieldValue::Signature(input @ SignatureInput::Image { .. }) => {
                let data = input.image_data().unwrap();
                assert_eq!(ImageFormat::from_magic_bytes(&data), Some(ImageFormat::Png));
            }
            other => panic!("unexpected value {:?}", other),
        }
    }

    #[test]
    fn test_bad_image_rejected() {
        let result = validate(
            &FieldKind::Signature,
            true,
            &"data:image/png;base64,bm90IGFuIGltYWdl".into(),
            &rules(),
        );
        assert_eq!(result, Err(ValidationError::InvalidImage));
        let result = validate(&FieldKind::Signature, true, &"data:image/png,abc".into(), &rules());
        assert_eq!(result, Err(ValidationError::InvalidImage));
    }

    #[test]
    fn test_image_with_valid_magic_but_corrupt_body_rejected() {
        let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        bytes.extend_from_slice(b"definitely not IHDR");
        let url = format!("data:image/png;base64,{}", STANDARD.encode(&bytes));
        let result = validate(&FieldKind::Signature, true, &url.as_str().into(), &rules());
        assert!(matches!(result, Err(ValidationError::UndecodableImage(_))));

        let jpeg = format!("data:image/jpeg;base64,{}", STANDARD.encode([0xFF, 0xD8, 0xFF, 0xE0, 0, 0]));
        let result = validate(&FieldKind::Initial, true, &jpeg.as_str().into(), &rules());
        assert!(matches!(result, Err(ValidationError::UndecodableImage(_))));
    }

    #[test]
    fn test_image_type_must_match_payload() {
        let url = format!("data:image/jpeg;base64,{}", TINY_PNG_B64);
        let result = validate(&FieldKind::Signature, true, &url.as_str().into(), &rules());
        assert_eq!(
            result,
            Err(ValidationError::ImageTypeMismatch {
                declared: "image/jpeg",
                actual: "image/png"
            })
        );

        let url = format!("data:image/gif;base64,{}", TINY_PNG_B64);
        let result = validate(&FieldKind::Signature, true, &url.as_str().into(), &rules());
        assert_eq!(result, Err(ValidationError::InvalidImage));
    }

    #[test]
    fn test_jpeg_signature() {
        let mut jpeg = std::io::Cursor::new(Vec::new());
        image::RgbImage::from_pixel(4, 2, image::Rgb([20, 20, 20]))
            .write_to(&mut jpeg, image::ImageFormat::Jpeg)
            .unwrap();
        let url = format!("data:image/jpg;base64,{}", STANDARD.encode(jpeg.get_ref()));
        let value = validate(&FieldKind::Signature, true, &url.as_str().into(), &rules()).unwrap();
        assert!(matches!(
            value,
            FieldValue::Signature(SignatureInput::Image {
                format: ImageFormat::Jpeg,
                ..
            })
        ));
    }

    #[test]
    fn test_date() {
        let value = validate(&FieldKind::Date, true, &"2024-02-29".into(), &rules()).unwrap();
        assert_eq!(
            value,
            FieldValue::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap())
        );
        assert!(matches!(
            validate(&FieldKind::Date, true, &"2023-02-29".into(), &rules()),
            Err(ValidationError::InvalidDate(_))
        ));
        assert!(matches!(
            validate(&FieldKind::Date, true, &"29/02/2024".into(), &rules()),
            Err(ValidationError::InvalidDate(_))
        ));
    }

    #[test]
    fn test_text_rules() {
        let kind = FieldKind::Text { max_length: Some(5) };
        assert_eq!(
            validate(&kind, true, &"hello".into(), &rules()),
            Ok(FieldValue::Text("hello".to_string()))
        );
        assert_eq!(
            validate(&kind, true, &"hello!".into(), &rules()),
            Err(ValidationError::TooLong { max: 5, actual: 6 })
        );
        assert_eq!(validate(&kind, true, &"   ".into(), &rules()), Err(ValidationError::Empty));
        assert_eq!(
            validate(&kind, false, &"".into(), &rules()),
            Ok(FieldValue::Text(String::new()))
        );
    }

    #[test]
    fn test_default_text_max_length() {
        let rules = ValidationRules {
            default_text_max_length: Some(3),
            ..ValidationRules::default()
        };
        let kind = FieldKind::Text { max_length: None };
        assert!(matches!(
            validate(&kind, true, &"abcd".into(), &rules),
            Err(ValidationError::TooLong { .. })
        ));
    }

    #[test]
    fn test_checkbox() {
        assert_eq!(
            validate(&FieldKind::Checkbox, true, &true.into(), &rules()),
            Ok(FieldValue::Checkbox(true))
        );
        assert!(matches!(
            validate(&FieldKind::Checkbox, true, &"yes".into(), &rules()),
            Err(ValidationError::WrongType { .. })
        ));
    }

    #[test]
    fn test_raw_value_json_shapes() {
        let raw: RawValue = serde_json::from_str("true").unwrap();
        assert_eq!(raw, RawValue::Bool(true));
        let raw: RawValue = serde_json::from_str("\"2024-01-01\"").unwrap();
        assert_eq!(raw, RawValue::Text("2024-01-01".to_string()));
        let raw: RawValue =
            serde_json::from_str(r#"[{"points":[{"x":0,"y":0,"t":0},{"x":1,"y":1,"t":8}]}]"#).unwrap();
        assert!(matches!(raw, RawValue::Strokes(ref s) if s.len() == 1));
    }

    #[test]
    fn test_field_kind_serde() {
        let json = serde_json::to_string(&FieldKind::Text { max_length: Some(10) }).unwrap();
        assert_eq!(json, r#"{"type":"text","max_length":10}"#);
        let kind: FieldKind = serde_json::from_str(r#"{"type":"signature"}"#).unwrap();
        assert_eq!(kind, FieldKind::Signature);
    }

    #[test]
    fn test_display_text() {
        assert_eq!(FieldValue::Checkbox(true).display_text().as_deref(), Some("Yes"));
        assert_eq!(
            FieldValue::Date(NaiveDate::from_ymd_opt(2025, 1, 9).unwrap())
                .display_text()
                .as_deref(),
            Some("2025-01-09")
        );
        let drawn = FieldValue::Signature(SignatureInput::Drawn { strokes: vec![] });
        assert_eq!(drawn.display_text(), None);
    }
}
