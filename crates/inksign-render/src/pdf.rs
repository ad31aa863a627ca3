//! Low-level PDF plumbing on top of lopdf: page geometry, resources, image
//! XObjects and content streams.

use crate::content::StandardFont;
use flate2::Compression;
use flate2::write::ZlibEncoder;
use image::RgbaImage;
use inksign_core::{PageDims, RenderError, Rotation};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream, dictionary};
use std::collections::BTreeMap;
use std::io::Write;

/// Page trees deeper than this are treated as cyclic.
const MAX_TREE_DEPTH: usize = 64;

fn invalid(e: lopdf::Error) -> RenderError {
    RenderError::InvalidDocument(e.to_string())
}

/// Parse a PDF.
pub fn load(bytes: &[u8]) -> Result<Document, RenderError> {
    if !bytes.starts_with(b"%PDF-") {
        return Err(RenderError::InvalidDocument("missing %PDF header".to_string()));
    }
    Document::load_mem(bytes).map_err(invalid)
}

/// Page object ids in page order.
pub fn page_ids(doc: &Document) -> Vec<ObjectId> {
    doc.get_pages().into_values().collect()
}

/// Follow a reference, if it is one.
fn resolve<'a>(doc: &'a Document, object: &'a Object) -> &'a Object {
    match object {
        Object::Reference(id) => doc.get_object(*id).unwrap_or(object),
        _ => object,
    }
}

/// Look up a page attribute, walking up the page tree for inheritable ones.
fn inherited<'a>(doc: &'a Document, page_id: ObjectId, key: &[u8]) -> Option<&'a Object> {
    let mut node = doc.get_dictionary(page_id).ok()?;
    for _ in 0..MAX_TREE_DEPTH {
        if let Ok(value) = node.get(key) {
            return Some(resolve(doc, value));
        }
        let parent = node.get(b"Parent").ok()?.as_reference().ok()?;
        node = doc.get_dictionary(parent).ok()?;
    }
    None
}

fn number(object: &Object) -> Option<f64> {
    match object {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(r) => Some(*r as f64),
        _ => None,
    }
}

/// Native geometry of a page: media box and display rotation.
pub fn page_dims(doc: &Document, page_id: ObjectId) -> Result<PageDims, RenderError> {
    let media_box = inherited(doc, page_id, b"MediaBox")
        .and_then(|o| o.as_array().ok())
        .ok_or_else(|| RenderError::InvalidDocument(format!("page {:?} has no MediaBox", page_id)))?;
    let coords: Vec<f64> = media_box
        .iter()
        .map(|o| number(resolve(doc, o)))
        .collect::<Option<_>>()
        .filter(|c: &Vec<f64>| c.len() == 4)
        .ok_or_else(|| RenderError::InvalidDocument(format!("page {:?} has a malformed MediaBox", page_id)))?;

    let (x0, x1) = (coords[0].min(coords[2]), coords[0].max(coords[2]));
    let (y0, y1) = (coords[1].min(coords[3]), coords[1].max(coords[3]));
    if !(x1 - x0 > 0.0 && y1 - y0 > 0.0) {
        return Err(RenderError::InvalidDocument(format!(
            "page {:?} has an empty MediaBox",
            page_id
        )));
    }

    let degrees = inherited(doc, page_id, b"Rotate")
        .and_then(|o| o.as_i64().ok())
        .unwrap_or(0);
    let rotation = Rotation::from_degrees(degrees).ok_or_else(|| {
        RenderError::InvalidDocument(format!("page {:?} has rotation {}", page_id, degrees))
    })?;

    Ok(PageDims::new(x1 - x0, y1 - y0)
        .with_origin(x0, y0)
        .with_rotation(rotation))
}

/// Geometry of every page of a document.
pub fn inspect(bytes: &[u8]) -> Result<Vec<PageDims>, RenderError> {
    let doc = load(bytes)?;
    page_ids(&doc)
        .into_iter()
        .map(|id| page_dims(&doc, id))
        .collect()
}

/// Deflate-compressed stream object.
pub fn compressed_stream(mut dict: Dictionary, data: &[u8]) -> Result<Stream, RenderError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| RenderError::Encode(e.to_string()))?;
    let compressed = encoder.finish().map_err(|e| RenderError::Encode(e.to_string()))?;
    dict.set("Filter", "FlateDecode");
    Ok(Stream::new(dict, compressed))
}

/// Embed an RGBA bitmap as an RGB image XObject with an alpha soft mask.
pub fn add_image(doc: &mut Document, image: &RgbaImage) -> Result<ObjectId, RenderError> {
    let (width, height) = image.dimensions();
    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    let mut alpha = Vec::with_capacity((width * height) as usize);
    for pixel in image.pixels() {
        let [r, g, b, a] = pixel.0;
        rgb.extend_from_slice(&[r, g, b]);
        alpha.push(a);
    }

    let smask = compressed_stream(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => width as i64,
            "Height" => height as i64,
            "ColorSpace" => "DeviceGray",
            "BitsPerComponent" => 8,
        },
        &alpha,
    )?;
    let smask_id = doc.add_object(smask);

    let xobject = compressed_stream(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => width as i64,
            "Height" => height as i64,
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8,
            "SMask" => Object::Reference(smask_id),
        },
        &rgb,
    )?;
    Ok(doc.add_object(xobject))
}

/// Font objects shared by every page of one render.
#[derive(Debug, Default)]
pub struct FontCache {
    fonts: BTreeMap<StandardFont, ObjectId>,
}

impl FontCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, doc: &mut Document, font: StandardFont) -> ObjectId {
        *self.fonts.entry(font).or_insert_with(|| {
            doc.add_object(dictionary! {
                "Type" => "Font",
                "Subtype" => "Type1",
                "BaseFont" => font.base_font(),
                "Encoding" => "WinAnsiEncoding",
            })
        })
    }
}

/// Resources for one page's overlay: the page's effective resources plus
/// whatever the overlay adds, under names that do not collide.
#[derive(Debug, Clone)]
pub struct PageResources {
    resources: Dictionary,
    xobjects: Dictionary,
    fonts: Dictionary,
    font_names: BTreeMap<StandardFont, String>,
    next_image: usize,
}

fn sub_dictionary(doc: &Document, resources: &Dictionary, key: &[u8]) -> Dictionary {
    resources
        .get(key)
        .ok()
        .map(|o| resolve(doc, o))
        .and_then(|o| o.as_dict().ok())
        .cloned()
        .unwrap_or_else(Dictionary::new)
}

fn unused_name(dict: &Dictionary, prefix: &str, start: usize) -> (String, usize) {
    let mut n = start;
    loop {
        let name = format!("{}{}", prefix, n);
        if !dict.has(name.as_bytes()) {
            return (name, n);
        }
        n += 1;
    }
}

impl PageResources {
    /// Resources currently in effect for a page (inherited if needed).
    pub fn for_page(doc: &Document, page_id: ObjectId) -> Self {
        let resources = inherited(doc, page_id, b"Resources")
            .and_then(|o| o.as_dict().ok())
            .cloned()
            .unwrap_or_else(Dictionary::new);
        Self::from_dictionary(doc, resources)
    }

    pub fn empty() -> Self {
        Self {
            resources: Dictionary::new(),
            xobjects: Dictionary::new(),
            fonts: Dictionary::new(),
            font_names: BTreeMap::new(),
            next_image: 0,
        }
    }

    fn from_dictionary(doc: &Document, resources: Dictionary) -> Self {
        let xobjects = sub_dictionary(doc, &resources, b"XObject");
        let fonts = sub_dictionary(doc, &resources, b"Font");
        Self {
            resources,
            xobjects,
            fonts,
            font_names: BTreeMap::new(),
            next_image: 0,
        }
    }

    /// Embed a bitmap and return its resource name.
    pub fn add_image(&mut self, doc: &mut Document, image: &RgbaImage) -> Result<String, RenderError> {
        let id = add_image(doc, image)?;
        let (name, n) = unused_name(&self.xobjects, "InkSignIm", self.next_image);
        self.next_image = n + 1;
        self.xobjects.set(name.clone(), Object::Reference(id));
        Ok(name)
    }

    /// Resource name of a standard font, registering it on first use.
    pub fn font(&mut self, doc: &mut Document, cache: &mut FontCache, font: StandardFont) -> String {
        if let Some(name) = self.font_names.get(&font) {
            return name.clone();
        }
        let id = cache.get(doc, font);
        let (name, _) = unused_name(&self.fonts, "InkSignF", self.font_names.len());
        self.fonts.set(name.clone(), Object::Reference(id));
        self.font_names.insert(font, name.clone());
        name
    }

    /// The merged resource dictionary.
    pub fn into_dictionary(mut self) -> Dictionary {
        if !self.xobjects.is_empty() {
            self.resources.set("XObject", Object::Dictionary(self.xobjects));
        }
        if !self.fonts.is_empty() {
            self.resources.set("Font", Object::Dictionary(self.fonts));
        }
        self.resources
    }

    /// Write the merged resources directly onto the page.
    pub fn install(self, doc: &mut Document, page_id: ObjectId) -> Result<(), RenderError> {
        let resources = self.into_dictionary();
        let page = doc.get_dictionary_mut(page_id).map_err(invalid)?;
        page.set("Resources", Object::Dictionary(resources));
        Ok(())
    }
}

/// Replace a page's contents with `q <original> Q <overlay>` in a single new
/// stream. The original stream objects are left untouched.
pub fn overlay_page(doc: &mut Document, page_id: ObjectId, overlay: &[u8]) -> Result<(), RenderError> {
    let original = doc.get_page_content(page_id).map_err(invalid)?;
    let mut content = Vec::with_capacity(original.len() + overlay.len() + 8);
    content.extend_from_slice(b"q\n");
    content.extend_from_slice(&original);
    content.extend_from_slice(b"\nQ\n");
    content.extend_from_slice(overlay);

    let stream_id = doc.add_object(compressed_stream(Dictionary::new(), &content)?);
    let page = doc.get_dictionary_mut(page_id).map_err(invalid)?;
    page.set("Contents", Object::Reference(stream_id));
    Ok(())
}

/// Append a page at the end of the root page tree.
pub fn append_page(
    doc: &mut Document,
    width: i64,
    height: i64,
    content: &[u8],
    resources: Dictionary,
) -> Result<ObjectId, RenderError> {
    let pages_id = doc
        .trailer
        .get(b"Root")
        .and_then(Object::as_reference)
        .and_then(|root| doc.get_dictionary(root))
        .and_then(|catalog| catalog.get(b"Pages"))
        .and_then(Object::as_reference)
        .map_err(invalid)?;

    let content_id = doc.add_object(compressed_stream(Dictionary::new(), content)?);
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => Object::Reference(pages_id),
        "MediaBox" => vec![0.into(), 0.into(), width.into(), height.into()],
        "Contents" => Object::Reference(content_id),
        "Resources" => Object::Dictionary(resources),
    });

    let pages = doc.get_dictionary_mut(pages_id).map_err(invalid)?;
    let count = pages.get(b"Count").and_then(Object::as_i64).unwrap_or(0);
    match pages.get_mut(b"Kids") {
        Ok(Object::Array(kids)) => kids.push(Object::Reference(page_id)),
        _ => {
            return Err(RenderError::InvalidDocument(
                "page tree root has no inline Kids array".to_string(),
            ));
        }
    }
    pages.set("Count", count + 1);
    Ok(page_id)
}

/// Serialize a document.
pub fn save(doc: &mut Document) -> Result<Vec<u8>, RenderError> {
    doc.prune_objects();
    let mut out = Vec::new();
    doc.save_to(&mut out)
        .map_err(|e| RenderError::Encode(e.to_string()))?;
    Ok(out)
}
