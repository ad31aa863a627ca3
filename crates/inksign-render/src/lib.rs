//! InkSign Render Library
//!
//! Signature rasterization and the lopdf-based compositor that flattens
//! filled fields into the final signed PDF.

mod certificate;
pub mod compositor;
pub mod content;
pub mod pdf;
pub mod raster;

pub use certificate::{Line as CertificateLine, certificate_lines};
pub use compositor::{PdfCompositor, RenderOptions};
pub use content::{ContentBuilder, StandardFont, TextRun};
pub use raster::{RasterOptions, SignatureMark, mark_for, preview_png};
