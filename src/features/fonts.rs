use rusttype::{Font, Scale};
use std::collections::HashMap;

/// Family name every unavailable font falls back to. Maps to the built-in
/// Helvetica metrics, which a PDF reader supplies without embedding.
pub const DEFAULT_FONT_FAMILY: &str = "Default";

/// Helvetica advance widths for ASCII 32..=126 in thousandths of an em
/// (Adobe core-14 AFM values).
const HELVETICA_WIDTHS: [u16; 95] = [
    278, 278, 355, 556, 556, 889, 667, 191, 333, 333, 389, 584, 278, 333, 278, 278, // 32..47
    556, 556, 556, 556, 556, 556, 556, 556, 556, 556, // 0..9
    278, 278, 584, 584, 584, 556, 1015, // :..@
    667, 667, 722, 722, 667, 611, 778, 722, 278, 500, 667, 556, 833, 722, 778, 667, // A..P
    778, 722, 667, 611, 722, 667, 944, 667, 667, 611, // Q..Z
    278, 278, 278, 469, 556, 333, // [..`
    556, 556, 500, 556, 556, 278, 556, 556, 222, 222, 500, 222, 833, 556, 556, 556, // a..p
    556, 333, 500, 278, 556, 500, 722, 500, 500, 500, // q..z
    334, 260, 334, 584, // {..~
];

/// Byte-code range covered by generated `Widths` arrays for embedded
/// programs, matching the codes text literals may carry (ASCII plus the
/// Latin-1 span WinAnsi shares).
pub const FIRST_CHAR: u8 = 32;
pub const LAST_CHAR: u8 = 255;

const HELVETICA_ASCENT: f64 = 0.718;
const HELVETICA_DESCENT: f64 = -0.207;
const FALLBACK_WIDTH: u16 = 556;

/// A family resolved against the registry.
pub enum ResolvedFont<'a> {
    /// Base-14 Helvetica; metrics only, no font program to embed.
    Builtin,
    /// A registered TrueType program to embed via FontFile2.
    Custom { family: &'a str, data: &'a [u8] },
}

/// Registered font programs keyed by family name. Registration validates the
/// program; lookups never fail, they fall back to the default family.
#[derive(Default)]
pub struct FontRegistry {
    faces: HashMap<String, Vec<u8>>,
}

impl FontRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, family: &str, ttf: Vec<u8>) -> Result<(), String> {
        if family.trim().is_empty() {
            return Err("font_family_empty".into());
        }
        if Font::try_from_vec(ttf.clone()).is_none() {
            return Err("font_parse_failed".into());
        }
        self.faces.insert(family.to_string(), ttf);
        Ok(())
    }

    pub fn contains(&self, family: &str) -> bool {
        self.faces.contains_key(family)
    }

    /// The family itself when available, otherwise the default. An
    /// unavailable font never fails a capture.
    pub fn resolve_family<'a>(&self, family: &'a str) -> &'a str {
        if self.contains(family) {
            family
        } else {
            DEFAULT_FONT_FAMILY
        }
    }

    pub fn resolve(&self, family: &str) -> ResolvedFont<'_> {
        match self.faces.get_key_value(family) {
            Some((name, data)) => ResolvedFont::Custom {
                family: name.as_str(),
                data: data.as_slice(),
            },
            None => ResolvedFont::Builtin,
        }
    }

    fn face(&self, family: &str) -> Option<Font<'_>> {
        self.faces
            .get(family)
            .and_then(|data| Font::try_from_bytes(data.as_slice()))
    }

    /// Advance width of `text` at `size` points.
    pub fn text_width(&self, family: &str, text: &str, size: f64) -> f64 {
        match self.face(family) {
            Some(font) => {
                let scale = Scale::uniform(size as f32);
                text.chars()
                    .map(|c| font.glyph(c).scaled(scale).h_metrics().advance_width as f64)
                    .sum()
            }
            None => {
                text.chars()
                    .map(|c| builtin_width(c) as f64 / 1000.0 * size)
                    .sum()
            }
        }
    }

    /// Ascent above the baseline at `size` points (positive).
    pub fn ascent(&self, family: &str, size: f64) -> f64 {
        match self.face(family) {
            Some(font) => font.v_metrics(Scale::uniform(size as f32)).ascent as f64,
            None => HELVETICA_ASCENT * size,
        }
    }

    /// Descent below the baseline at `size` points (negative).
    pub fn descent(&self, family: &str, size: f64) -> f64 {
        match self.face(family) {
            Some(font) => font.v_metrics(Scale::uniform(size as f32)).descent as f64,
            None => HELVETICA_DESCENT * size,
        }
    }

    /// Line box height (ascent minus descent) at `size` points.
    pub fn text_height(&self, family: &str, size: f64) -> f64 {
        self.ascent(family, size) - self.descent(family, size)
    }
}

fn builtin_width(c: char) -> u16 {
    let code = c as u32;
    if (32..=126).contains(&code) {
        HELVETICA_WIDTHS[(code - 32) as usize]
    } else {
        FALLBACK_WIDTH
    }
}

/// PDF `Widths` array for a registered program, FIRST_CHAR to LAST_CHAR in
/// thousandths of an em. Byte codes map to chars as Latin-1; the 0x80..0x9F
/// hole never appears in escaped text literals.
pub fn widths_array(data: &[u8]) -> Result<Vec<i64>, String> {
    let font = Font::try_from_bytes(data).ok_or_else(|| "font_parse_failed".to_string())?;
    let scale = Scale::uniform(1000.0);
    Ok((FIRST_CHAR..=LAST_CHAR)
        .map(|code| {
            font.glyph(code as char)
                .scaled(scale)
                .h_metrics()
                .advance_width
                .round() as i64
        })
        .collect())
}

/// Ascent and descent for a registered program in thousandths of an em, for
/// the PDF FontDescriptor.
pub fn descriptor_metrics(data: &[u8]) -> Result<(i64, i64), String> {
    let font = Font::try_from_bytes(data).ok_or_else(|| "font_parse_failed".to_string())?;
    let metrics = font.v_metrics(Scale::uniform(1000.0));
    Ok((metrics.ascent.round() as i64, metrics.descent.round() as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_width_table() {
        let registry = FontRegistry::new();
        // space + uppercase J at 10pt: (278 + 500) / 1000 * 10
        let width = registry.text_width(DEFAULT_FONT_FAMILY, " J", 10.0);
        assert!((width - 7.78).abs() < 1e-9);
        assert!(registry.text_width(DEFAULT_FONT_FAMILY, "Jane Doe", 12.0) > 0.0);
    }

    #[test]
    fn test_unknown_family_falls_back_to_default() {
        let registry = FontRegistry::new();
        assert_eq!(registry.resolve_family("Great Vibes"), DEFAULT_FONT_FAMILY);
        assert!(matches!(
            registry.resolve("Great Vibes"),
            ResolvedFont::Builtin
        ));
    }

    #[test]
    fn test_register_rejects_invalid_program() {
        let mut registry = FontRegistry::new();
        let err = registry.register("Broken", vec![0u8; 32]).unwrap_err();
        assert_eq!(err, "font_parse_failed");
        assert!(!registry.contains("Broken"));
    }

    #[test]
    fn test_non_ascii_measures_with_fallback_width() {
        let registry = FontRegistry::new();
        let width = registry.text_width(DEFAULT_FONT_FAMILY, "é", 10.0);
        assert!((width - 5.56).abs() < 1e-9);
    }

    #[test]
    fn test_line_box_height_is_positive() {
        let registry = FontRegistry::new();
        let height = registry.text_height(DEFAULT_FONT_FAMILY, 12.0);
        assert!((height - 0.925 * 12.0).abs() < 1e-9);
    }
}
