use std::collections::BTreeMap;

use lopdf::{dictionary, Document, Object, Stream};
use uuid::Uuid;

use crate::features::capture::{parse_hex_rgb, SignatureContent};
use crate::features::fonts::{
    descriptor_metrics, widths_array, FontRegistry, ResolvedFont, FIRST_CHAR, LAST_CHAR,
};
use crate::features::overlay::SignatureMark;
use crate::features::storage::{resolve_source, DocumentStore};
use crate::session::{DocumentSession, DocumentSource, MediaKind, PageGeometry};

const MIN_TEXT_SIZE_PT: f64 = 4.0;
const TEXT_BOX_FILL: f64 = 0.7;

pub fn load_document(bytes: &[u8]) -> Result<Document, String> {
    Document::load_mem(bytes).map_err(|e| format!("pdf_parse_failed:{e}"))
}

/// Native page size in points, walking up to the pages tree when the page
/// dict has no MediaBox of its own.
pub fn page_dimensions(doc: &Document, page_id: lopdf::ObjectId) -> Result<(f64, f64), String> {
    let mut current = Some(page_id);
    while let Some(id) = current {
        let dict = doc
            .get_object(id)
            .and_then(|o| o.as_dict())
            .map_err(|_| "embed_page_missing_dict")?;
        if let Some((w, h)) = extract_media_box(doc, dict) {
            return Ok((w, h));
        }
        current = dict.get(b"Parent").and_then(|p| p.as_reference()).ok();
    }
    // Fallback to a reasonable page size (A4-ish) if metadata is missing.
    Ok((595.0, 842.0))
}

fn extract_media_box(doc: &Document, dict: &lopdf::Dictionary) -> Option<(f64, f64)> {
    let raw = dict.get(b"MediaBox").ok()?;
    let resolved = match raw {
        Object::Reference(id) => doc.get_object(*id).ok()?,
        other => other,
    };
    let arr = resolved.as_array().ok()?;
    if arr.len() != 4 {
        return None;
    }
    let llx = obj_to_f64(&arr[0])?;
    let lly = obj_to_f64(&arr[1])?;
    let urx = obj_to_f64(&arr[2])?;
    let ury = obj_to_f64(&arr[3])?;
    Some((urx - llx, ury - lly))
}

fn obj_to_f64(obj: &Object) -> Option<f64> {
    match obj {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(f) => Some((*f).into()),
        _ => None,
    }
}

/// Rotation-aware bounding box of a mark in page units, origin bottom-left.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl UnitBox {
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// Project a mark's normalized center and pixel size into page units. The
/// vertical axis flips because the overlay measures from the top edge and
/// PDF user space grows upward.
pub fn unit_box(mark: &SignatureMark, geometry: &PageGeometry) -> UnitBox {
    let (w_px, h_px) = if mark.rotation.is_sideways() {
        (mark.height_px, mark.width_px)
    } else {
        (mark.width_px, mark.height_px)
    };
    let width = w_px * geometry.scale_x();
    let height = h_px * geometry.scale_y();
    let center_x = mark.left * geometry.unit_width;
    let center_y = geometry.unit_height - mark.top * geometry.unit_height;
    UnitBox {
        x: center_x - width / 2.0,
        y: center_y - height / 2.0,
        width,
        height,
    }
}

fn ensure_resource_dict<'a>(
    res_dict: &'a mut lopdf::Dictionary,
    key: &str,
) -> Result<&'a mut lopdf::Dictionary, String> {
    let owned = res_dict
        .remove(key.as_bytes())
        .unwrap_or_else(|| Object::Dictionary(dictionary! {}));

    let sanitized = match owned {
        Object::Dictionary(dict) => Object::Dictionary(dict),
        Object::Reference(_) => Object::Dictionary(dictionary! {}),
        _ => return Err("embed_resources_invalid".into()),
    };

    res_dict.set(key, sanitized);
    match res_dict.get_mut(key.as_bytes()) {
        Ok(Object::Dictionary(ref mut dict)) => Ok(dict),
        _ => Err("embed_resources_invalid".into()),
    }
}

/// Register `target` under the page's resource dictionary, following an
/// indirect Resources reference when the document uses one.
fn set_page_resource(
    doc: &mut Document,
    page_id: lopdf::ObjectId,
    category: &str,
    name: &str,
    target: lopdf::ObjectId,
) -> Result<(), String> {
    let mut resources_obj = {
        let page_dict = doc
            .get_object_mut(page_id)
            .and_then(|o| o.as_dict_mut())
            .map_err(|_| "embed_page_missing_dict")?;
        page_dict
            .remove(b"Resources")
            .unwrap_or_else(|| Object::Dictionary(dictionary! {}))
    };

    match &mut resources_obj {
        Object::Reference(id) => {
            let res_dict = doc
                .get_object_mut(*id)
                .and_then(|o| o.as_dict_mut())
                .map_err(|_| "embed_resources_missing_dict")?;
            ensure_resource_dict(res_dict, category)?.set(name, target);
        }
        Object::Dictionary(ref mut dict) => {
            ensure_resource_dict(dict, category)?.set(name, target);
        }
        _ => return Err("embed_resources_invalid".into()),
    }

    let page_dict = doc
        .get_object_mut(page_id)
        .and_then(|o| o.as_dict_mut())
        .map_err(|_| "embed_page_missing_dict")?;
    page_dict.set("Resources", resources_obj);
    Ok(())
}

/// Escape a string for a PDF literal. Parens and backslashes are escaped,
/// the WinAnsi upper range goes out as octal escapes, anything else falls
/// back to `?`.
fn escape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '(' => out.push_str("\\("),
            ')' => out.push_str("\\)"),
            '\\' => out.push_str("\\\\"),
            c if (' '..='~').contains(&c) => out.push(c),
            c if (0xA1..=0xFF).contains(&(c as u32)) => {
                out.push_str(&format!("\\{:03o}", c as u32))
            }
            _ => out.push('?'),
        }
    }
    out
}

fn sanitized_font_name(family: &str) -> String {
    let name: String = family.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    if name.is_empty() {
        "Custom".to_string()
    } else {
        name
    }
}

/// Add the font object for the resolved family: a base-14 Helvetica dict or
/// a full embedded TrueType program (FontFile2 + FontDescriptor + Widths).
fn add_font_object(doc: &mut Document, resolved: &ResolvedFont<'_>) -> Result<lopdf::ObjectId, String> {
    match resolved {
        ResolvedFont::Builtin => Ok(doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        })),
        ResolvedFont::Custom { family, data } => {
            let base_name = sanitized_font_name(family);
            let (ascent, descent) = descriptor_metrics(data)?;
            let widths: Vec<Object> = widths_array(data)?
                .into_iter()
                .map(Object::Integer)
                .collect();

            let file_id = doc.add_object(Stream::new(
                dictionary! { "Length1" => data.len() as i64 },
                data.to_vec(),
            ));
            let descriptor_id = doc.add_object(dictionary! {
                "Type" => "FontDescriptor",
                "FontName" => Object::Name(base_name.clone().into_bytes()),
                "Flags" => 32,
                "FontBBox" => vec![(-200).into(), descent.into(), 1200.into(), ascent.into()],
                "ItalicAngle" => 0,
                "Ascent" => ascent,
                "Descent" => descent,
                "CapHeight" => ascent,
                "StemV" => 80,
                "FontFile2" => file_id,
            });
            Ok(doc.add_object(dictionary! {
                "Type" => "Font",
                "Subtype" => "TrueType",
                "BaseFont" => Object::Name(base_name.into_bytes()),
                "FirstChar" => FIRST_CHAR as i64,
                "LastChar" => LAST_CHAR as i64,
                "Widths" => widths,
                "FontDescriptor" => descriptor_id,
                "Encoding" => "WinAnsiEncoding",
            }))
        }
    }
}

/// cos/sin pairs for the quarter-turn rotations, counterclockwise in PDF
/// user space (which matches clockwise on a top-down screen).
fn rotation_matrix(degrees: u16) -> (i32, i32) {
    match degrees {
        90 => (0, 1),
        180 => (-1, 0),
        270 => (0, -1),
        _ => (1, 0),
    }
}

fn embed_text(
    doc: &mut Document,
    page_id: lopdf::ObjectId,
    mark: &SignatureMark,
    geometry: &PageGeometry,
    fonts: &FontRegistry,
    value: &str,
    font_family: &str,
    color_hex: &str,
    seq: usize,
) -> Result<(), String> {
    let resolved = fonts.resolve(font_family);
    let font_id = add_font_object(doc, &resolved)?;
    let font_name = format!("SigF{seq}");
    set_page_resource(doc, page_id, "Font", &font_name, font_id)?;

    // Text is measured against the unrotated box; the cm matrix rotates the
    // whole thing around the mark's center.
    let box_width = mark.width_px * geometry.scale_x();
    let box_height = mark.height_px * geometry.scale_y();
    let mut size = box_height * TEXT_BOX_FILL;
    let width_at_start = fonts.text_width(font_family, value, size);
    if width_at_start > box_width && width_at_start > 0.0 {
        size = (size * box_width / width_at_start).max(MIN_TEXT_SIZE_PT);
    }
    let text_width = fonts.text_width(font_family, value, size);
    let baseline_drop = (fonts.ascent(font_family, size) + fonts.descent(font_family, size)) / 2.0;

    let bbox = unit_box(mark, geometry);
    let (center_x, center_y) = bbox.center();
    let rgb = parse_hex_rgb(color_hex)?;
    let (c, s) = rotation_matrix(mark.rotation.degrees());

    let content = format!(
        "q {c} {s} {ms} {c} {cx:.2} {cy:.2} cm BT /{font} {size:.2} Tf {r:.3} {g:.3} {b:.3} rg {tx:.2} {ty:.2} Td ({text}) Tj ET Q",
        c = c,
        s = s,
        ms = -s,
        cx = center_x,
        cy = center_y,
        font = font_name,
        size = size,
        r = rgb[0] as f64 / 255.0,
        g = rgb[1] as f64 / 255.0,
        b = rgb[2] as f64 / 255.0,
        tx = -text_width / 2.0,
        ty = -baseline_drop,
        text = escape_text(value),
    );
    doc.add_page_contents(page_id, content.into_bytes())
        .map_err(|e| format!("embed_add_content_failed:{e}"))
}

fn embed_raster(
    doc: &mut Document,
    page_id: lopdf::ObjectId,
    mark: &SignatureMark,
    geometry: &PageGeometry,
    image_bytes: &[u8],
    format: image::ImageFormat,
    seq: usize,
) -> Result<(), String> {
    let decoded = image::load_from_memory_with_format(image_bytes, format)
        .map_err(|e| format!("embed_image_invalid:{e}"))?
        .to_rgba8();
    // Quarter turns are baked into the pixels; the bounding box already
    // accounts for the swapped extents.
    let rotated = match mark.rotation.degrees() {
        90 => image::imageops::rotate270(&decoded),
        180 => image::imageops::rotate180(&decoded),
        270 => image::imageops::rotate90(&decoded),
        _ => decoded,
    };
    let (img_w, img_h) = rotated.dimensions();
    if img_w == 0 || img_h == 0 {
        return Err("embed_image_empty".into());
    }

    let mut rgb = Vec::with_capacity((img_w * img_h * 3) as usize);
    let mut alpha = Vec::with_capacity((img_w * img_h) as usize);
    for pixel in rotated.pixels() {
        rgb.push(pixel[0]);
        rgb.push(pixel[1]);
        rgb.push(pixel[2]);
        alpha.push(pixel[3]);
    }

    let smask_id = doc.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => img_w as i64,
            "Height" => img_h as i64,
            "ColorSpace" => "DeviceGray",
            "BitsPerComponent" => 8,
        },
        alpha,
    ));
    let image_id = doc.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => img_w as i64,
            "Height" => img_h as i64,
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8,
            "SMask" => smask_id,
        },
        rgb,
    ));

    let name = format!("Sig{seq}");
    set_page_resource(doc, page_id, "XObject", &name, image_id)?;

    let bbox = unit_box(mark, geometry);
    let fit = (bbox.width / img_w as f64).min(bbox.height / img_h as f64);
    let draw_width = img_w as f64 * fit;
    let draw_height = img_h as f64 * fit;
    let (center_x, center_y) = bbox.center();

    let content = format!(
        "q {w:.2} 0 0 {h:.2} {x:.2} {y:.2} cm /{name} Do Q",
        w = draw_width,
        h = draw_height,
        x = center_x - draw_width / 2.0,
        y = center_y - draw_height / 2.0,
        name = name,
    );
    doc.add_page_contents(page_id, content.into_bytes())
        .map_err(|e| format!("embed_add_content_failed:{e}"))
}

fn embed_mark(
    doc: &mut Document,
    pages: &BTreeMap<u32, lopdf::ObjectId>,
    mark: &SignatureMark,
    geometry: &PageGeometry,
    fonts: &FontRegistry,
    seq: usize,
) -> Result<(), String> {
    let page_no = mark.page_index as u32 + 1;
    let page_id = *pages
        .get(&page_no)
        .ok_or_else(|| "page_out_of_range".to_string())?;

    // Page units come from the document itself; the render-time geometry
    // contributes only the pixel side of the conversion.
    let (unit_width, unit_height) = page_dimensions(doc, page_id)?;
    let effective = PageGeometry {
        unit_width,
        unit_height,
        ..geometry.clone()
    };

    let content = mark
        .content
        .as_ref()
        .ok_or_else(|| "mark_missing_content".to_string())?;
    match content {
        SignatureContent::Text {
            value,
            font_family,
            color_hex,
        } => embed_text(
            doc, page_id, mark, &effective, fonts, value, font_family, color_hex, seq,
        ),
        SignatureContent::Raster {
            image_bytes,
            origin_format,
        } => embed_raster(
            doc,
            page_id,
            mark,
            &effective,
            image_bytes,
            origin_format.to_image_format(),
            seq,
        ),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeOutcome {
    pub document_locator: String,
    pub embedded: usize,
    pub skipped: usize,
}

/// Bake every committed, still-unlocked mark into the PDF byte stream, write
/// the result to the store, and repoint the session at the new bytes. One
/// sequential pass; per-mark failures are logged and skipped, a storage
/// failure is fatal and leaves the session untouched.
pub fn finalize(
    session: &mut DocumentSession,
    fonts: &FontRegistry,
    store: &dyn DocumentStore,
) -> Result<FinalizeOutcome, String> {
    if session.media != Some(MediaKind::Pdf) {
        return Err("document_not_pdf".into());
    }
    let pending: Vec<Uuid> = session
        .marks
        .iter()
        .filter(|m| m.committed && !m.deleted && !m.locked)
        .map(|m| m.id)
        .collect();
    if pending.is_empty() {
        return Err("no_committed_marks".into());
    }

    let bytes = resolve_source(session, store)?;
    let mut doc = load_document(&bytes)?;
    let pages: BTreeMap<u32, lopdf::ObjectId> = doc.get_pages();

    let mut written: Vec<Uuid> = Vec::new();
    let mut skipped = 0usize;
    for (seq, id) in pending.into_iter().enumerate() {
        let mark = match session.mark(id) {
            Some(m) => m.clone(),
            None => continue,
        };
        let geometry = match session.geometry_for(mark.page_index) {
            Some(g) => g.clone(),
            None => {
                log::warn!("mark {id} skipped: missing_page_geometry");
                skipped += 1;
                continue;
            }
        };
        match embed_mark(&mut doc, &pages, &mark, &geometry, fonts, seq) {
            Ok(()) => written.push(id),
            Err(e) => {
                log::warn!("mark {id} skipped: {e}");
                skipped += 1;
            }
        }
    }
    if written.is_empty() {
        return Err("all_marks_failed".into());
    }

    let mut output = Vec::new();
    doc.save_to(&mut output)
        .map_err(|e| format!("pdf_save_failed:{e}"))?;
    let locator = store.put(&output)?;

    // Marks lock and metadata moves only once the bytes are safely stored.
    let embedded = written.len();
    for id in written {
        if let Some(mark) = session.mark_mut(id) {
            mark.locked = true;
        }
    }
    session.document_locator = Some(locator.clone());
    session.source = Some(DocumentSource::Locator(locator.clone()));
    Ok(FinalizeOutcome {
        document_locator: locator,
        embedded,
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::capture::RasterFormat;
    use crate::features::storage::FileStore;
    use image::codecs::png::PngEncoder;
    use image::{ImageEncoder, Rgba, RgbaImage};

    fn fixture_pdf(page_count: usize) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let mut kids: Vec<Object> = Vec::new();
        for _ in 0..page_count {
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            });
            kids.push(Object::Reference(page_id));
        }
        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).expect("save fixture");
        bytes
    }

    fn geometry(page_index: usize) -> PageGeometry {
        PageGeometry {
            page_index,
            unit_width: 612.0,
            unit_height: 792.0,
            pixel_width: 900.0,
            pixel_height: 1166.0,
            offset_top: page_index as f64 * 1178.0,
        }
    }

    fn session_with_fixture(bytes: &[u8]) -> DocumentSession {
        let mut session = DocumentSession::new("owner@x.com");
        session.open_document(DocumentSource::Buffer(bytes.to_vec()), MediaKind::Pdf);
        session.record_geometry(geometry(0));
        session
    }

    fn committed_text_mark(value: &str) -> SignatureMark {
        let mut mark = SignatureMark::new(0, 0.5, 0.5, "owner@x.com");
        mark.content = Some(SignatureContent::Text {
            value: value.to_string(),
            font_family: "Default".to_string(),
            color_hex: "#111927".to_string(),
        });
        mark.committed = true;
        mark
    }

    fn page_content(bytes: &[u8]) -> String {
        let doc = Document::load_mem(bytes).expect("reload");
        let pages = doc.get_pages();
        let page_id = *pages.get(&1).expect("page 1");
        String::from_utf8_lossy(&doc.get_page_content(page_id).expect("content")).into_owned()
    }

    #[test]
    fn test_unit_box_centers_mark_on_letter_page() {
        let mark = committed_text_mark("Jane Doe");
        let bbox = unit_box(&mark, &geometry(0));
        let (cx, cy) = bbox.center();
        assert!((cx - 306.0).abs() < 0.5, "center x was {cx}");
        assert!((cy - 396.0).abs() < 0.5, "center y was {cy}");
        assert!((bbox.width - 200.0 * 612.0 / 900.0).abs() < 1e-6);
    }

    #[test]
    fn test_sideways_mark_swaps_box_extents() {
        let mut mark = committed_text_mark("x");
        mark.rotation = crate::features::overlay::Rotation::R90;
        let bbox = unit_box(&mark, &geometry(0));
        assert!(bbox.height > bbox.width);
    }

    #[test]
    fn test_finalize_rejects_zero_committed_marks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path().to_path_buf());
        let bytes = fixture_pdf(1);
        let mut session = session_with_fixture(&bytes);
        session.marks.push(SignatureMark::new(0, 0.5, 0.5, "owner@x.com"));

        let err = finalize(&mut session, &FontRegistry::new(), &store).expect_err("rejected");
        assert_eq!(err, "no_committed_marks");
        assert!(session.document_locator.is_none(), "no bytes produced");
    }

    #[test]
    fn test_finalize_bakes_typed_text_into_page() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path().to_path_buf());
        let bytes = fixture_pdf(1);
        let mut session = session_with_fixture(&bytes);
        session.marks.push(committed_text_mark("Jane Doe"));

        let outcome = finalize(&mut session, &FontRegistry::new(), &store).expect("finalize");
        assert_eq!(outcome.embedded, 1);
        assert_eq!(outcome.skipped, 0);
        assert!(session.marks[0].locked);
        assert_eq!(session.document_locator.as_deref(), Some(outcome.document_locator.as_str()));

        let baked = store.get(&outcome.document_locator).expect("stored bytes");
        let content = page_content(&baked);
        assert!(content.contains("(Jane Doe) Tj"), "content was: {content}");
        assert!(content.contains("BT"));
        // The box center lands at (306, 396) on a letter page.
        assert!(content.contains("306"));
        assert!(content.contains("396"));
    }

    #[test]
    fn test_refinalize_without_new_marks_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path().to_path_buf());
        let bytes = fixture_pdf(1);
        let mut session = session_with_fixture(&bytes);
        session.marks.push(committed_text_mark("Jane Doe"));

        finalize(&mut session, &FontRegistry::new(), &store).expect("first pass");
        let err = finalize(&mut session, &FontRegistry::new(), &store).expect_err("no-op");
        assert_eq!(err, "no_committed_marks");
    }

    #[test]
    fn test_finalize_embeds_raster_with_smask() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path().to_path_buf());
        let bytes = fixture_pdf(1);
        let mut session = session_with_fixture(&bytes);

        let img = RgbaImage::from_pixel(40, 16, Rgba([20, 30, 40, 200]));
        let mut png = Vec::new();
        PngEncoder::new(&mut png)
            .write_image(img.as_raw(), 40, 16, image::ColorType::Rgba8)
            .expect("encode");
        let mut mark = SignatureMark::new(0, 0.5, 0.5, "owner@x.com");
        mark.content = Some(SignatureContent::Raster {
            image_bytes: png,
            origin_format: RasterFormat::Png,
        });
        mark.committed = true;
        session.marks.push(mark);

        let outcome = finalize(&mut session, &FontRegistry::new(), &store).expect("finalize");
        assert_eq!(outcome.embedded, 1);
        let baked = store.get(&outcome.document_locator).expect("stored bytes");
        let content = page_content(&baked);
        assert!(content.contains("/Sig0 Do"), "content was: {content}");
    }

    #[test]
    fn test_mark_without_geometry_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path().to_path_buf());
        let bytes = fixture_pdf(2);
        let mut session = session_with_fixture(&bytes);
        session.marks.push(committed_text_mark("Jane Doe"));
        let mut orphan = committed_text_mark("No geometry");
        orphan.page_index = 1;
        session.marks.push(orphan);

        let outcome = finalize(&mut session, &FontRegistry::new(), &store).expect("finalize");
        assert_eq!(outcome.embedded, 1);
        assert_eq!(outcome.skipped, 1);
        assert!(session.marks[0].locked);
        assert!(!session.marks[1].locked, "skipped mark stays unlocked");
    }

    struct RejectingStore;

    impl DocumentStore for RejectingStore {
        fn put(&self, _bytes: &[u8]) -> Result<String, String> {
            Err("store_write_failed:disk full".into())
        }

        fn get(&self, _locator: &str) -> Result<Vec<u8>, String> {
            Err("store_open_failed:unreachable".into())
        }
    }

    #[test]
    fn test_storage_write_failure_is_fatal_and_mutates_nothing() {
        let bytes = fixture_pdf(1);
        let mut session = session_with_fixture(&bytes);
        session.marks.push(committed_text_mark("Jane Doe"));

        let err = finalize(&mut session, &FontRegistry::new(), &RejectingStore).unwrap_err();
        assert!(err.starts_with("store_write_failed"), "err was: {err}");
        assert!(session.document_locator.is_none(), "old locator stays authoritative");
        assert!(!session.marks[0].locked, "mark stays re-finalizable");
        assert!(matches!(session.source, Some(DocumentSource::Buffer(_))));

        // A rerun against a working store picks the mark up from scratch.
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path().to_path_buf());
        let outcome = finalize(&mut session, &FontRegistry::new(), &store).expect("rerun");
        assert_eq!(outcome.embedded, 1);
        assert!(session.marks[0].locked);
    }

    #[test]
    fn test_text_literal_escaping() {
        assert_eq!(escape_text("a(b)c\\"), "a\\(b\\)c\\\\");
        assert_eq!(escape_text("café"), "caf\\351");
        assert_eq!(escape_text("snow\u{2603}"), "snow?");
    }

    #[test]
    fn test_escaped_octal_codes_fall_inside_widths_range() {
        let escaped = escape_text("café ü ÿ Æ");
        let mut rest = escaped.as_str();
        let mut seen = 0;
        while let Some(pos) = rest.find('\\') {
            let code = u32::from_str_radix(&rest[pos + 1..pos + 4], 8).expect("octal escape");
            assert!(code >= FIRST_CHAR as u32, "code {code} below FirstChar");
            assert!(code <= LAST_CHAR as u32, "code {code} above LastChar");
            seen += 1;
            rest = &rest[pos + 4..];
        }
        assert_eq!(seen, 4, "escaped was: {escaped}");
    }
}
