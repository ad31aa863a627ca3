//! The PDF compositor: flattens filled fields onto the original pages.

use crate::certificate;
use crate::content::{ContentBuilder, StandardFont, TextRun};
use crate::pdf::{self, FontCache, PageResources};
use crate::raster::{self, RasterOptions, SignatureMark};
use inksign_core::{
    Compositor, Field, FieldFrame, FieldValue, PageDims, RenderError, RenderRequest, Signer,
};
use kurbo::Point;
use lopdf::Document;
use std::collections::BTreeMap;

/// Compositor settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderOptions {
    /// Append a completion certificate after the last page.
    pub certificate_page: bool,
    /// Font size of the signer/date stamp under signatures.
    pub stamp_font_size: f64,
    /// Distance between stamp baselines.
    pub stamp_line_gap: f64,
    /// Color of text and checkbox values.
    pub text_color: [u8; 3],
    pub raster: RasterOptions,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            certificate_page: true,
            stamp_font_size: 8.0,
            stamp_line_gap: 10.0,
            text_color: [0, 0, 0],
            raster: RasterOptions::default(),
        }
    }
}

/// Stamps signatures, text and checkmarks into PDFs with lopdf.
#[derive(Debug, Clone, Default)]
pub struct PdfCompositor {
    options: RenderOptions,
}

/// Mutable state shared by all fields drawn onto one page.
struct PageCanvas<'a> {
    doc: &'a mut Document,
    fonts: &'a mut FontCache,
    resources: PageResources,
    content: ContentBuilder,
}

impl PageCanvas<'_> {
    fn text(&mut self, run: &TextRun) {
        let name = self.resources.font(self.doc, self.fonts, run.font);
        self.content.text(&name, run);
    }
}

impl PdfCompositor {
    pub fn new(options: RenderOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    fn draw_field(
        &self,
        canvas: &mut PageCanvas<'_>,
        field: &Field,
        signer: Option<&Signer>,
        dims: &PageDims,
    ) -> Result<(), RenderError> {
        let Some(value) = &field.value else {
            return Ok(());
        };
        let frame = FieldFrame::new(&field.rect, dims)?;

        match value {
            FieldValue::Signature(input) => {
                match raster::mark_for(input, frame.width, frame.height, &self.options.raster)? {
                    SignatureMark::Bitmap(image) => {
                        let name = canvas.resources.add_image(canvas.doc, &image)?;
                        canvas
                            .content
                            .save()
                            .transform(frame.unit_square_matrix())
                            .draw_xobject(&name)
                            .restore();
                    }
                    SignatureMark::Lettering(run) => {
                        canvas
                            .content
                            .save()
                            .transform(frame.to_page)
                            .fill_rgb(self.options.raster.ink);
                        canvas.text(&run);
                        canvas.content.restore();
                    }
                }
                if field.kind.is_signature() {
                    self.draw_stamp(canvas, field, signer, &frame);
                }
            }
            FieldValue::Checkbox(true) => {
                let (w, h) = (frame.width, frame.height);
                let check = [
                    Point::new(0.2 * w, 0.52 * h),
                    Point::new(0.42 * w, 0.24 * h),
                    Point::new(0.8 * w, 0.8 * h),
                ];
                canvas
                    .content
                    .save()
                    .transform(frame.to_page)
                    .stroke_rgb(self.options.text_color)
                    .line_width((w.min(h) * 0.1).max(0.8))
                    .round_lines()
                    .polyline(&check)
                    .restore();
            }
            FieldValue::Checkbox(false) => {}
            FieldValue::Date(_) | FieldValue::Text(_) => {
                let text = value.display_text().unwrap_or_default();
                let inset = (frame.width * 0.05).min(2.0);
                let run = TextRun::fit(
                    &text,
                    StandardFont::Helvetica,
                    frame.width,
                    frame.height,
                    inset,
                    false,
                );
                canvas
                    .content
                    .save()
                    .transform(frame.to_page)
                    .fill_rgb(self.options.text_color);
                canvas.text(&run);
                canvas.content.restore();
            }
        }
        Ok(())
    }

    /// "Signer:" and "Date:" lines just below a signature, in the field frame.
    fn draw_stamp(&self, canvas: &mut PageCanvas<'_>, field: &Field, signer: Option<&Signer>, frame: &FieldFrame) {
        let mut lines = Vec::new();
        if field.stamp.include_name {
            if let Some(signer) = signer {
                lines.push(format!("Signer: {}", signer.identity.name));
            }
        }
        if field.stamp.include_date {
            if let Some(at) = field.filled_at {
                lines.push(format!("Date: {}", at.format("%Y-%m-%d %H:%M UTC")));
            }
        }
        if lines.is_empty() {
            return;
        }

        canvas
            .content
            .save()
            .transform(frame.to_page)
            .fill_rgb(self.options.text_color);
        for (i, line) in lines.into_iter().enumerate() {
            let baseline = -self.options.stamp_line_gap * (i + 1) as f64;
            let run = TextRun::new(line, StandardFont::Helvetica, self.options.stamp_font_size, 0.0, baseline);
            canvas.text(&run);
        }
        canvas.content.restore();
    }
}

impl Compositor for PdfCompositor {
    fn inspect(&self, document: &[u8]) -> Result<Vec<PageDims>, RenderError> {
        pdf::inspect(document)
    }

    fn render(&self, request: &RenderRequest<'_>) -> Result<Vec<u8>, RenderError> {
        let mut doc = pdf::load(request.document)?;
        let page_ids = pdf::page_ids(&doc);

        let mut by_page: BTreeMap<usize, Vec<&Field>> = BTreeMap::new();
        for field in request.fields.iter().filter(|f| f.is_filled()) {
            by_page.entry(field.page_index).or_default().push(field);
        }

        let mut fonts = FontCache::new();
        for (page_index, mut fields) in by_page {
            let page_id = *page_ids.get(page_index).ok_or(RenderError::PageOutOfRange {
                page_index,
                page_count: page_ids.len(),
            })?;
            let dims = pdf::page_dims(&doc, page_id)?;
            fields.sort_by_key(|f| f.id);

            let resources = PageResources::for_page(&doc, page_id);
            let mut canvas = PageCanvas {
                doc: &mut doc,
                fonts: &mut fonts,
                resources,
                content: ContentBuilder::new(),
            };
            for field in &fields {
                self.draw_field(&mut canvas, field, request.signer(field), &dims)?;
            }

            let PageCanvas { resources, content, .. } = canvas;
            resources.install(&mut doc, page_id)?;
            pdf::overlay_page(&mut doc, page_id, &content.finish()?)?;
            log::debug!("Composited {} field(s) onto page {}", fields.len(), page_index + 1);
        }

        if self.options.certificate_page {
            certificate::append_certificate(&mut doc, &mut fonts, request)?;
        }
        let bytes = pdf::save(&mut doc)?;
        log::info!(
            "Rendered document {} ({} bytes)",
            request.document_key,
            bytes.len()
        );
        Ok(bytes)
    }
}
