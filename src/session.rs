use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::features::capture::COLOR_PALETTE;
use crate::features::overlay::SignatureMark;

/// Resolved content kind of the working document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaKind {
    Pdf,
    Image,
}

/// Sniff the document kind from magic bytes; extensions are not trusted.
pub fn resolve_media_kind(bytes: &[u8]) -> Result<MediaKind, String> {
    let kind = infer::get(bytes).ok_or_else(|| "unknown_media_type".to_string())?;
    match kind.mime_type() {
        "application/pdf" => Ok(MediaKind::Pdf),
        "image/png" | "image/jpeg" | "image/webp" => Ok(MediaKind::Image),
        other => Err(format!("unsupported_media_type:{other}")),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub email: String,
    pub color_hex: String,
}

/// Where the working document's bytes come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DocumentSource {
    Locator(String),
    Buffer(Vec<u8>),
}

/// Native page size in PDF points paired with the last-rendered on-screen
/// pixel size. This is the only source of truth for pixel/point conversion;
/// it is replaced on every repaint and must never survive a resize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageGeometry {
    pub page_index: usize,
    pub unit_width: f64,
    pub unit_height: f64,
    pub pixel_width: f64,
    pub pixel_height: f64,
    pub offset_top: f64,
}

impl PageGeometry {
    pub fn scale_x(&self) -> f64 {
        if self.pixel_width > 0.0 {
            self.unit_width / self.pixel_width
        } else {
            0.0
        }
    }

    pub fn scale_y(&self) -> f64 {
        if self.pixel_height > 0.0 {
            self.unit_height / self.pixel_height
        } else {
            0.0
        }
    }
}

/// The working unit: one opened document plus everything authored on top of
/// it. Created when a document is opened, discarded on switch or teardown
/// (after any in-flight render pass has been cancelled).
pub struct DocumentSession {
    pub id: Uuid,
    pub owner_email: String,
    pub participants: Vec<Participant>,
    pub source: Option<DocumentSource>,
    pub media: Option<MediaKind>,
    pub pages: Vec<PageGeometry>,
    pub marks: Vec<SignatureMark>,
    pub document_locator: Option<String>,
}

impl DocumentSession {
    pub fn new(owner_email: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_email: owner_email.to_string(),
            participants: Vec::new(),
            source: None,
            media: None,
            pages: Vec::new(),
            marks: Vec::new(),
            document_locator: None,
        }
    }

    pub fn open_document(&mut self, source: DocumentSource, kind: MediaKind) {
        self.source = Some(source);
        self.media = Some(kind);
        self.pages.clear();
        self.marks.clear();
    }

    /// Teardown for a document switch. The caller must have cancelled any
    /// in-flight render pass before calling this.
    pub fn reset(&mut self) {
        self.source = None;
        self.media = None;
        self.pages.clear();
        self.marks.clear();
        self.document_locator = None;
    }

    pub fn geometry_for(&self, page_index: usize) -> Option<&PageGeometry> {
        self.pages.iter().find(|g| g.page_index == page_index)
    }

    /// Record a page's geometry as it finishes rendering. A repaint of the
    /// same index replaces the stale entry.
    pub fn record_geometry(&mut self, geometry: PageGeometry) {
        if let Some(existing) = self
            .pages
            .iter_mut()
            .find(|g| g.page_index == geometry.page_index)
        {
            *existing = geometry;
        } else {
            self.pages.push(geometry);
            self.pages.sort_by_key(|g| g.page_index);
        }
    }

    pub fn clear_geometry(&mut self) {
        self.pages.clear();
    }

    pub fn mark(&self, id: Uuid) -> Option<&SignatureMark> {
        self.marks.iter().find(|m| m.id == id)
    }

    pub fn mark_mut(&mut self, id: Uuid) -> Option<&mut SignatureMark> {
        self.marks.iter_mut().find(|m| m.id == id)
    }

    /// Marks that still have a visual element (soft-deleted records are kept
    /// for id stability but not shown).
    pub fn visible_marks(&self) -> impl Iterator<Item = &SignatureMark> {
        self.marks.iter().filter(|m| !m.deleted)
    }

    pub fn is_owner(&self, actor_email: &str) -> bool {
        self.owner_email == actor_email
    }

    /// Register a signing participant, cycling through the palette for their
    /// overlay color. Re-registering an email keeps the original color.
    pub fn add_participant(&mut self, email: &str) -> Participant {
        if let Some(existing) = self.participants.iter().find(|p| p.email == email) {
            return existing.clone();
        }
        let participant = Participant {
            email: email.to_string(),
            color_hex: COLOR_PALETTE[self.participants.len() % COLOR_PALETTE.len()].to_string(),
        };
        self.participants.push(participant.clone());
        participant
    }

    pub fn participant_color(&self, email: &str) -> Option<&str> {
        self.participants
            .iter()
            .find(|p| p.email == email)
            .map(|p| p.color_hex.as_str())
    }

    /// Lossless draft serialization of the mark list for the document-store
    /// boundary.
    pub fn export_marks(&self) -> Result<String, String> {
        serde_json::to_string(&self.marks).map_err(|e| format!("marks_serialize_failed:{e}"))
    }

    pub fn import_marks(&mut self, payload: &str) -> Result<(), String> {
        let marks: Vec<SignatureMark> =
            serde_json::from_str(payload).map_err(|e| format!("marks_parse_failed:{e}"))?;
        self.marks = marks;
        Ok(())
    }
}
