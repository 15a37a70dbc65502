use image::imageops::FilterType;
use image::{Rgba, RgbaImage};
use lopdf::Document;
use std::time::{Duration, Instant};

use crate::features::embed::page_dimensions;
use crate::features::CancelToken;
use crate::session::{DocumentSession, MediaKind, PageGeometry};

/// Quiet window for coalescing resize events.
pub const RESIZE_QUIET: Duration = Duration::from_millis(250);
/// Vertical gap between stacked pages in the scroll container.
pub const PAGE_GAP_PX: f64 = 12.0;

/// Viewport description for one render pass.
#[derive(Debug, Clone, Copy)]
pub struct RenderRequest {
    pub viewport_width: f64,
    pub viewport_height: f64,
    pub device_pixel_ratio: f64,
}

/// One painted page surface, allocated at device-pixel-ratio scale.
pub struct PageSurface {
    pub page_index: usize,
    pub surface: RgbaImage,
}

/// Rasterizer for PDF page content. The engine allocates and sizes the
/// surface, tracks lifecycle and cancellation; the platform's PDF renderer
/// fills in the pixels (image documents are decoded in-engine).
pub trait PagePaint {
    fn paint(&mut self, page_index: usize, surface: &mut RgbaImage) -> Result<(), String>;
}

/// Leaves surfaces blank; geometry-only passes and tests.
pub struct BlankPainter;

impl PagePaint for BlankPainter {
    fn paint(&mut self, _page_index: usize, _surface: &mut RgbaImage) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderOutcome {
    pub rendered: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: bool,
}

/// Coalesces a burst of resize events into one re-render after a quiet
/// window.
pub struct ResizeDebouncer {
    pending: Option<Instant>,
    quiet: Duration,
}

impl ResizeDebouncer {
    pub fn new(quiet: Duration) -> Self {
        Self { pending: None, quiet }
    }

    pub fn note(&mut self, now: Instant) {
        self.pending = Some(now);
    }

    pub fn due(&self, now: Instant) -> bool {
        self.pending
            .map(|last| now.duration_since(last) >= self.quiet)
            .unwrap_or(false)
    }

    pub fn take(&mut self) -> bool {
        self.pending.take().is_some()
    }
}

/// Owns page surfaces and the in-flight pass. Exactly one pass may be in
/// progress per session; starting a new one cancels the previous token
/// first.
pub struct PageRenderer {
    pages: Vec<PageSurface>,
    in_flight: Option<CancelToken>,
    pub resize: ResizeDebouncer,
}

impl Default for PageRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl PageRenderer {
    pub fn new() -> Self {
        Self {
            pages: Vec::new(),
            in_flight: None,
            resize: ResizeDebouncer::new(RESIZE_QUIET),
        }
    }

    /// Request cancellation of any prior pass and hand out the token for the
    /// next one.
    pub fn begin_pass(&mut self) -> CancelToken {
        if let Some(prior) = self.in_flight.take() {
            prior.cancel();
        }
        let token = CancelToken::new();
        self.in_flight = Some(token.clone());
        token
    }

    pub fn surface(&self, page_index: usize) -> Option<&PageSurface> {
        self.pages.iter().find(|p| p.page_index == page_index)
    }

    pub fn surfaces(&self) -> &[PageSurface] {
        &self.pages
    }

    fn has_surface(&self, page_index: usize) -> bool {
        self.pages.iter().any(|p| p.page_index == page_index)
    }

    /// Drop every surface and the session's geometry. Runs on cancellation,
    /// resize, and document switch so no stale surface outlives its pass.
    pub fn teardown(&mut self, session: &mut DocumentSession) {
        self.pages.clear();
        session.clear_geometry();
    }

    /// View unmount: cancel whatever is in flight and release surfaces.
    pub fn shutdown(&mut self, session: &mut DocumentSession) {
        if let Some(prior) = self.in_flight.take() {
            prior.cancel();
        }
        self.teardown(session);
    }

    /// Paint every page of the open document in order, appending geometry to
    /// the session as each page completes. Page failures are logged and the
    /// pass continues; cancellation tears down cleanly.
    pub fn render_document(
        &mut self,
        session: &mut DocumentSession,
        bytes: &[u8],
        request: &RenderRequest,
        painter: &mut dyn PagePaint,
        token: &CancelToken,
    ) -> Result<RenderOutcome, String> {
        if request.viewport_width <= 0.0 || request.viewport_height <= 0.0 {
            return Err("viewport_empty".into());
        }
        let media = session.media.ok_or_else(|| "no_document_open".to_string())?;
        let outcome = match media {
            MediaKind::Pdf => self.render_pdf(session, bytes, request, painter, token)?,
            MediaKind::Image => self.render_image(session, bytes, request, token)?,
        };
        self.in_flight = None;
        Ok(outcome)
    }

    fn render_pdf(
        &mut self,
        session: &mut DocumentSession,
        bytes: &[u8],
        request: &RenderRequest,
        painter: &mut dyn PagePaint,
        token: &CancelToken,
    ) -> Result<RenderOutcome, String> {
        let doc = Document::load_mem(bytes).map_err(|e| format!("pdf_parse_failed:{e}"))?;
        let mut outcome = RenderOutcome::default();
        let mut offset_top = 0.0;

        for (page_no, page_id) in doc.get_pages() {
            if token.is_cancelled() {
                self.teardown(session);
                outcome.cancelled = true;
                return Ok(outcome);
            }
            let page_index = (page_no - 1) as usize;

            // Idempotent paging: never render the same index twice. A page
            // kept from an earlier pass is re-anchored at the current running
            // offset, which moves when a previously failed page now renders.
            if self.has_surface(page_index) {
                if let Some(existing) = session
                    .pages
                    .iter_mut()
                    .find(|g| g.page_index == page_index)
                {
                    existing.offset_top = offset_top;
                    offset_top += existing.pixel_height + PAGE_GAP_PX;
                }
                outcome.skipped += 1;
                continue;
            }

            let (unit_width, unit_height) = match page_dimensions(&doc, page_id) {
                Ok(dims) => dims,
                Err(e) => {
                    log::warn!("page {page_index} has no usable geometry: {e}");
                    outcome.failed += 1;
                    continue;
                }
            };

            let scale = request.viewport_width / unit_width;
            let pixel_width = (unit_width * scale).round();
            let pixel_height = (unit_height * scale).round();
            let surface_width = (pixel_width * request.device_pixel_ratio).round() as u32;
            let surface_height = (pixel_height * request.device_pixel_ratio).round() as u32;
            let mut surface =
                RgbaImage::from_pixel(surface_width.max(1), surface_height.max(1), Rgba([255; 4]));

            // The paint call is the suspension point; check the flag on both
            // sides of it.
            if token.is_cancelled() {
                self.teardown(session);
                outcome.cancelled = true;
                return Ok(outcome);
            }
            if let Err(e) = painter.paint(page_index, &mut surface) {
                log::warn!("page {page_index} failed to paint: {e}");
                outcome.failed += 1;
                continue;
            }
            if token.is_cancelled() {
                self.teardown(session);
                outcome.cancelled = true;
                return Ok(outcome);
            }

            session.record_geometry(PageGeometry {
                page_index,
                unit_width,
                unit_height,
                pixel_width,
                pixel_height,
                offset_top,
            });
            self.pages.push(PageSurface { page_index, surface });
            offset_top += pixel_height + PAGE_GAP_PX;
            outcome.rendered += 1;
        }
        Ok(outcome)
    }

    /// A single raster image renders as one page sized to fit the viewport
    /// while preserving aspect ratio.
    fn render_image(
        &mut self,
        session: &mut DocumentSession,
        bytes: &[u8],
        request: &RenderRequest,
        token: &CancelToken,
    ) -> Result<RenderOutcome, String> {
        let mut outcome = RenderOutcome::default();
        if self.has_surface(0) {
            outcome.skipped = 1;
            return Ok(outcome);
        }
        if token.is_cancelled() {
            self.teardown(session);
            outcome.cancelled = true;
            return Ok(outcome);
        }
        let decoded = match image::load_from_memory(bytes) {
            Ok(img) => img.to_rgba8(),
            Err(e) => {
                log::warn!("image document failed to decode: {e}");
                outcome.failed = 1;
                return Ok(outcome);
            }
        };
        if token.is_cancelled() {
            self.teardown(session);
            outcome.cancelled = true;
            return Ok(outcome);
        }

        let (native_width, native_height) = (decoded.width() as f64, decoded.height() as f64);
        let scale = (request.viewport_width / native_width)
            .min(request.viewport_height / native_height);
        let pixel_width = (native_width * scale).round();
        let pixel_height = (native_height * scale).round();
        let surface = image::imageops::resize(
            &decoded,
            ((pixel_width * request.device_pixel_ratio).round() as u32).max(1),
            ((pixel_height * request.device_pixel_ratio).round() as u32).max(1),
            FilterType::Triangle,
        );

        session.record_geometry(PageGeometry {
            page_index: 0,
            unit_width: native_width,
            unit_height: native_height,
            pixel_width,
            pixel_height,
            offset_top: 0.0,
        });
        self.pages.push(PageSurface { page_index: 0, surface });
        outcome.rendered = 1;
        Ok(outcome)
    }

    /// Debounced-resize entry point: cancel any conflicting pass, tear down
    /// every page, and repaint at the new scale.
    pub fn apply_resize(
        &mut self,
        session: &mut DocumentSession,
        bytes: &[u8],
        request: &RenderRequest,
        painter: &mut dyn PagePaint,
    ) -> Result<RenderOutcome, String> {
        self.resize.take();
        let token = self.begin_pass();
        self.teardown(session);
        self.render_document(session, bytes, request, painter, &token)
    }
}
