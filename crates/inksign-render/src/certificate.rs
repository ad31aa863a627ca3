//! Completion certificate appended after the last page.

use crate::content::{ContentBuilder, StandardFont, TextRun};
use crate::pdf::{self, FontCache, PageResources};
use chrono::{DateTime, Utc};
use inksign_core::{Field, RenderError, RenderRequest};
use lopdf::Document;

const PAGE_WIDTH: i64 = 612;
const PAGE_HEIGHT: i64 = 792;
const MARGIN: f64 = 54.0;

/// One line of certificate text.
#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    pub font: StandardFont,
    pub size: f64,
    pub text: String,
}

impl Line {
    fn new(font: StandardFont, size: f64, text: impl Into<String>) -> Self {
        Self {
            font,
            size,
            text: text.into(),
        }
    }

    fn advance(&self) -> f64 {
        self.size * 1.45
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// The certificate text. Only field snapshot data is used, so the output is
/// fully determined by the content hash.
pub fn certificate_lines(request: &RenderRequest<'_>) -> Vec<Line> {
    use StandardFont::{Helvetica, HelveticaBold};

    let mut filled: Vec<&Field> = request.fields.iter().filter(|f| f.is_filled()).collect();
    filled.sort_by_key(|f| (f.filled_at, f.page_index, f.id));

    let mut lines = vec![
        Line::new(HelveticaBold, 18.0, "Certificate of Completion"),
        Line::new(Helvetica, 9.0, format!("Document: {}", request.document_key)),
    ];
    if let Some(completed) = filled.iter().filter_map(|f| f.filled_at).max() {
        lines.push(Line::new(Helvetica, 9.0, format!("Completed: {}", timestamp(&completed))));
    }

    lines.push(Line::new(HelveticaBold, 12.0, "Signers"));
    for signer in request.signers {
        let theirs: Vec<&Field> = filled.iter().copied().filter(|f| f.signer_id == signer.id).collect();
        let text = match theirs.iter().filter_map(|f| f.filled_at).max() {
            Some(last) => format!(
                "{}: signed {} field(s), last on {}",
                signer.identity,
                theirs.len(),
                timestamp(&last)
            ),
            None => format!("{}: no fields signed", signer.identity),
        };
        lines.push(Line::new(Helvetica, 9.0, text));
    }

    lines.push(Line::new(HelveticaBold, 12.0, "Fields"));
    for field in filled {
        let who = request
            .signer(field)
            .map(|s| s.identity.to_string())
            .unwrap_or_else(|| field.signer_id.to_string());
        let when = field.filled_at.as_ref().map(timestamp).unwrap_or_default();
        lines.push(Line::new(
            Helvetica,
            9.0,
            format!("{} on page {}, {} at {}", field.kind.name(), field.page_index + 1, who, when),
        ));
    }
    lines
}

/// Lay out lines into pages of certificate content.
fn paginate(lines: &[Line]) -> Vec<Vec<(f64, &Line)>> {
    let top = PAGE_HEIGHT as f64 - MARGIN;
    let mut pages = vec![Vec::new()];
    let mut y = top;
    for line in lines {
        y -= line.advance();
        if y < MARGIN {
            pages.push(Vec::new());
            y = top - line.advance();
        }
        if let Some(page) = pages.last_mut() {
            page.push((y, line));
        }
    }
    pages
}

/// Append certificate page(s); returns how many were added.
pub fn append_certificate(
    doc: &mut Document,
    fonts: &mut FontCache,
    request: &RenderRequest<'_>,
) -> Result<usize, RenderError> {
    let lines = certificate_lines(request);
    let pages = paginate(&lines);
    for page in &pages {
        let mut resources = PageResources::empty();
        let mut content = ContentBuilder::new();
        content.fill_rgb([0, 0, 0]);
        for (y, line) in page {
            let name = resources.font(doc, fonts, line.font);
            content.text(&name, &TextRun::new(line.text.clone(), line.font, line.size, MARGIN, *y));
        }
        pdf::append_page(doc, PAGE_WIDTH, PAGE_HEIGHT, &content.finish()?, resources.into_dictionary())?;
    }
    log::debug!("Appended {} certificate page(s) with {} lines", pages.len(), lines.len());
    Ok(pages.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use inksign_core::{
        Envelope, FieldKind, FieldSpec, FieldValue, NormalizedRect, OrderMode, PageDims, RequestContext,
    };
    use inksign_core::{DocumentInfo, NewSigner};

    fn envelope(fields: usize) -> Envelope {
        let document = DocumentInfo::new("abc123".to_string(), vec![PageDims::letter()]);
        let signer = NewSigner::new("Ada Lovelace", "ada@example.com");
        let specs = (0..fields)
            .map(|i| {
                FieldSpec::new(
                    FieldKind::Checkbox,
                    0,
                    NormalizedRect::new(0.1, 0.001 * i as f64, 0.01, 0.001),
                    signer.id,
                )
            })
            .collect();
        let (mut envelope, _) = Envelope::create(
            &document,
            vec![signer],
            specs,
            OrderMode::Parallel,
            &RequestContext::system(),
            DateTime::parse_from_rfc3339("2025-01-02T03:04:05Z").unwrap().with_timezone(&Utc),
        )
        .unwrap();
        let at = envelope.created_at;
        for field in &mut envelope.fields {
            field.value = Some(FieldValue::Checkbox(true));
            field.filled_at = Some(at);
        }
        envelope
    }

    #[test]
    fn test_certificate_lists_fields_and_signers() {
        let env = envelope(2);
        let request = RenderRequest::for_envelope(&env, b"");
        let lines = certificate_lines(&request);
        let text: Vec<&str> = lines.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(text[0], "Certificate of Completion");
        assert!(text.contains(&"Document: abc123"));
        assert!(text.contains(&"Completed: 2025-01-02 03:04:05 UTC"));
        assert!(text.contains(&"Ada Lovelace <ada@example.com>: signed 2 field(s), last on 2025-01-02 03:04:05 UTC"));
        assert_eq!(
            text.iter()
                .filter(|t| t.starts_with("checkbox on page 1, Ada Lovelace"))
                .count(),
            2
        );
    }

    #[test]
    fn test_long_certificates_paginate() {
        let env = envelope(120);
        let request = RenderRequest::for_envelope(&env, b"");
        let lines = certificate_lines(&request);
        let pages = paginate(&lines);
        assert!(pages.len() > 1);
        for page in &pages {
            assert!(page.iter().all(|(y, _)| *y >= MARGIN));
        }
        assert_eq!(pages.iter().map(Vec::len).sum::<usize>(), lines.len());
    }
}
