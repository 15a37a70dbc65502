use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use image::codecs::png::PngEncoder;
use image::{ImageEncoder, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::features::fonts::{FontRegistry, DEFAULT_FONT_FAMILY};
use crate::features::CancelToken;

/// The fixed typed-signature color palette.
pub const COLOR_PALETTE: [&str; 5] = ["#111927", "#1D4ED8", "#047857", "#B91C1C", "#6D28D9"];

/// Default drawing surface size in device-independent pixels.
const CANVAS_WIDTH: u32 = 600;
const CANVAS_HEIGHT: u32 = 240;
const STROKE_RADIUS: f32 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RasterFormat {
    Png,
    Jpeg,
    Webp,
}

impl RasterFormat {
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "image/png" => Some(RasterFormat::Png),
            "image/jpeg" => Some(RasterFormat::Jpeg),
            "image/webp" => Some(RasterFormat::Webp),
            _ => None,
        }
    }

    pub fn to_image_format(self) -> image::ImageFormat {
        match self {
            RasterFormat::Png => image::ImageFormat::Png,
            RasterFormat::Jpeg => image::ImageFormat::Jpeg,
            RasterFormat::Webp => image::ImageFormat::WebP,
        }
    }
}

/// What ends up on a mark. Immutable once committed; re-capturing replaces
/// the whole value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SignatureContent {
    Text {
        value: String,
        font_family: String,
        color_hex: String,
    },
    Raster {
        image_bytes: Vec<u8>,
        origin_format: RasterFormat,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureMode {
    Typed,
    Drawn,
    Uploaded,
}

/// `#RRGGBB` to byte components.
pub fn parse_hex_rgb(hex: &str) -> Result<[u8; 3], String> {
    let raw = hex.strip_prefix('#').unwrap_or(hex);
    if raw.len() != 6 || !raw.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("invalid_color_hex:{hex}"));
    }
    let parse = |range: std::ops::Range<usize>| {
        u8::from_str_radix(&raw[range], 16).map_err(|e| format!("invalid_color_hex:{e}"))
    };
    Ok([parse(0..2)?, parse(2..4)?, parse(4..6)?])
}

/// Authoring state for exactly one mark. One mode is active at a time;
/// switching modes abandons any in-flight load and clears partial input.
pub struct CaptureSession {
    pub mark_id: Uuid,
    pub mode: CaptureMode,
    pub typed_value: String,
    pub font_family: String,
    pub color_hex: String,
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub upload_in_progress: bool,
    strokes: Vec<Vec<(f32, f32)>>,
    current_stroke: Vec<(f32, f32)>,
    upload: Option<(RasterFormat, Vec<u8>)>,
    cancel: CancelToken,
}

impl CaptureSession {
    pub fn new(mark_id: Uuid) -> Self {
        Self {
            mark_id,
            mode: CaptureMode::Typed,
            typed_value: String::new(),
            font_family: DEFAULT_FONT_FAMILY.to_string(),
            color_hex: COLOR_PALETTE[0].to_string(),
            canvas_width: CANVAS_WIDTH,
            canvas_height: CANVAS_HEIGHT,
            upload_in_progress: false,
            strokes: Vec::new(),
            current_stroke: Vec::new(),
            upload: None,
            cancel: CancelToken::new(),
        }
    }

    /// Token for this capture's async steps (font probe, file read, decode).
    /// Replaced on every mode switch so abandoned loads die quietly.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Switching modes abandons in-flight work and partial input from every
    /// mode; nothing half-captured survives.
    pub fn switch_mode(&mut self, mode: CaptureMode) {
        self.cancel.cancel();
        self.cancel = CancelToken::new();
        self.mode = mode;
        self.typed_value.clear();
        self.strokes.clear();
        self.current_stroke.clear();
        self.upload = None;
        self.upload_in_progress = false;
    }

    pub fn set_typed_value(&mut self, value: &str) {
        self.typed_value = value.to_string();
    }

    /// Requested family is kept as-is; availability is resolved at finish so
    /// swatch previews never block on font loading.
    pub fn set_font_family(&mut self, family: &str) {
        self.font_family = family.to_string();
    }

    pub fn set_color(&mut self, color_hex: &str) -> Result<(), String> {
        if !COLOR_PALETTE.contains(&color_hex) {
            return Err(format!("color_not_in_palette:{color_hex}"));
        }
        self.color_hex = color_hex.to_string();
        Ok(())
    }

    /// Map a touch point into the same local coordinate space mouse events
    /// arrive in (relative to the drawing surface origin).
    pub fn map_touch(
        surface_left: f32,
        surface_top: f32,
        touch_x: f32,
        touch_y: f32,
    ) -> (f32, f32) {
        (touch_x - surface_left, touch_y - surface_top)
    }

    pub fn begin_stroke(&mut self, x: f32, y: f32) {
        self.current_stroke = vec![(x, y)];
    }

    pub fn extend_stroke(&mut self, x: f32, y: f32) {
        if !self.current_stroke.is_empty() {
            self.current_stroke.push((x, y));
        }
    }

    pub fn end_stroke(&mut self) {
        if self.current_stroke.len() > 1 {
            self.strokes.push(std::mem::take(&mut self.current_stroke));
        } else {
            self.current_stroke.clear();
        }
    }

    pub fn clear_drawing(&mut self) {
        self.strokes.clear();
        self.current_stroke.clear();
    }

    pub fn begin_upload(&mut self) {
        self.upload = None;
        self.upload_in_progress = true;
    }

    /// Validate and stage uploaded raster bytes. Kind is sniffed from magic
    /// bytes and the image must actually decode.
    pub fn handle_upload_bytes(&mut self, bytes: Vec<u8>) -> Result<RasterFormat, String> {
        self.upload_in_progress = false;
        if self.cancel.is_cancelled() {
            return Err("capture_cancelled".into());
        }
        let kind = infer::get(&bytes).ok_or_else(|| "unsupported_image_type".to_string())?;
        let format = RasterFormat::from_mime(kind.mime_type())
            .ok_or_else(|| format!("unsupported_image_type:{}", kind.mime_type()))?;
        image::load_from_memory_with_format(&bytes, format.to_image_format())
            .map_err(|e| format!("image_decode_failed:{e}"))?;
        if self.cancel.is_cancelled() {
            return Err("capture_cancelled".into());
        }
        self.upload = Some((format, bytes));
        Ok(format)
    }

    /// Shell boundary variant: payload arrives base64-encoded.
    pub fn handle_upload_base64(&mut self, payload: &str) -> Result<RasterFormat, String> {
        let bytes = B64
            .decode(payload.as_bytes())
            .map_err(|e| format!("upload_decode_failed:{e}"))?;
        self.handle_upload_bytes(bytes)
    }

    /// Produce the final content value, or reject locally before anything
    /// reaches the overlay model.
    pub fn finish(&self, fonts: &FontRegistry) -> Result<SignatureContent, String> {
        match self.mode {
            CaptureMode::Typed => {
                let value = self.typed_value.trim();
                if value.is_empty() {
                    return Err("empty_text".into());
                }
                parse_hex_rgb(&self.color_hex)?;
                Ok(SignatureContent::Text {
                    value: value.to_string(),
                    font_family: fonts.resolve_family(&self.font_family).to_string(),
                    color_hex: self.color_hex.clone(),
                })
            }
            CaptureMode::Drawn => {
                if self.strokes.is_empty() {
                    return Err("empty_drawing".into());
                }
                let rgb = parse_hex_rgb(&self.color_hex)?;
                let image_bytes = rasterize_strokes(
                    &self.strokes,
                    self.canvas_width,
                    self.canvas_height,
                    STROKE_RADIUS,
                    rgb,
                )?;
                Ok(SignatureContent::Raster {
                    image_bytes,
                    origin_format: RasterFormat::Png,
                })
            }
            CaptureMode::Uploaded => {
                let (origin_format, image_bytes) =
                    self.upload.clone().ok_or_else(|| "missing_upload".to_string())?;
                Ok(SignatureContent::Raster {
                    image_bytes,
                    origin_format,
                })
            }
        }
    }
}

/// Stamp the stroke polylines onto a transparent canvas and encode as PNG.
pub fn rasterize_strokes(
    strokes: &[Vec<(f32, f32)>],
    width: u32,
    height: u32,
    radius: f32,
    rgb: [u8; 3],
) -> Result<Vec<u8>, String> {
    if width == 0 || height == 0 {
        return Err("canvas_empty".into());
    }
    let mut canvas = RgbaImage::new(width, height);
    for stroke in strokes {
        for pair in stroke.windows(2) {
            stamp_segment(&mut canvas, pair[0], pair[1], radius, rgb);
        }
    }

    let mut buffer = Vec::new();
    PngEncoder::new(&mut buffer)
        .write_image(canvas.as_raw(), width, height, image::ColorType::Rgba8)
        .map_err(|e| format!("drawing_encode_failed:{e}"))?;
    Ok(buffer)
}

fn stamp_segment(
    canvas: &mut RgbaImage,
    from: (f32, f32),
    to: (f32, f32),
    radius: f32,
    rgb: [u8; 3],
) {
    let dx = to.0 - from.0;
    let dy = to.1 - from.1;
    let length = (dx * dx + dy * dy).sqrt();
    let steps = length.ceil().max(1.0) as u32;
    for i in 0..=steps {
        let t = i as f32 / steps as f32;
        stamp_disc(canvas, from.0 + dx * t, from.1 + dy * t, radius, rgb);
    }
}

fn stamp_disc(canvas: &mut RgbaImage, cx: f32, cy: f32, radius: f32, rgb: [u8; 3]) {
    let r = radius.ceil() as i32;
    for oy in -r..=r {
        for ox in -r..=r {
            if (ox * ox + oy * oy) as f32 > radius * radius {
                continue;
            }
            let x = cx.round() as i32 + ox;
            let y = cy.round() as i32 + oy;
            if x >= 0 && y >= 0 && (x as u32) < canvas.width() && (y as u32) < canvas.height() {
                canvas.put_pixel(x as u32, y as u32, Rgba([rgb[0], rgb[1], rgb[2], 255]));
            }
        }
    }
}
