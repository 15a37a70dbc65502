use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::features::capture::SignatureContent;
use crate::session::{DocumentSession, PageGeometry};

/// Minimum mark edge on each axis, in device-independent pixels.
pub const MIN_MARK_SIZE_PX: f64 = 30.0;
pub const DEFAULT_MARK_WIDTH_PX: f64 = 200.0;
pub const DEFAULT_MARK_HEIGHT_PX: f64 = 80.0;

/// Jitter applied when duplicating a mark, as a fraction of the page.
const DUPLICATE_JITTER: f64 = 0.08;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rotation {
    R0,
    R90,
    R180,
    R270,
}

impl Rotation {
    pub fn degrees(self) -> u16 {
        match self {
            Rotation::R0 => 0,
            Rotation::R90 => 90,
            Rotation::R180 => 180,
            Rotation::R270 => 270,
        }
    }

    /// Next quarter turn in the rotate cycle.
    pub fn step(self) -> Self {
        match self {
            Rotation::R0 => Rotation::R90,
            Rotation::R90 => Rotation::R180,
            Rotation::R180 => Rotation::R270,
            Rotation::R270 => Rotation::R0,
        }
    }

    /// At 90/270 the mark's width and height trade places for bounds math.
    pub fn is_sideways(self) -> bool {
        matches!(self, Rotation::R90 | Rotation::R270)
    }
}

/// One signature placement. `left`/`top` are the mark's center as a fraction
/// of the page; size stays in pixels and is never normalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureMark {
    pub id: Uuid,
    pub page_index: usize,
    pub left: f64,
    pub top: f64,
    pub width_px: f64,
    pub height_px: f64,
    pub rotation: Rotation,
    pub owner_email: String,
    pub content: Option<SignatureContent>,
    pub committed: bool,
    pub deleted: bool,
    pub locked: bool,
}

impl SignatureMark {
    pub fn new(page_index: usize, left: f64, top: f64, owner_email: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            page_index,
            left,
            top,
            width_px: DEFAULT_MARK_WIDTH_PX,
            height_px: DEFAULT_MARK_HEIGHT_PX,
            rotation: Rotation::R0,
            owner_email: owner_email.to_string(),
            content: None,
            committed: false,
            deleted: false,
            locked: false,
        }
    }

    /// Rotation-aware half extents normalized against a page geometry.
    pub fn half_extents(&self, geometry: &PageGeometry) -> (f64, f64) {
        let (w, h) = if self.rotation.is_sideways() {
            (self.height_px, self.width_px)
        } else {
            (self.width_px, self.height_px)
        };
        if geometry.pixel_width <= 0.0 || geometry.pixel_height <= 0.0 {
            return (0.0, 0.0);
        }
        (
            w / (2.0 * geometry.pixel_width),
            h / (2.0 * geometry.pixel_height),
        )
    }

    /// True when the full rotation-aware bounding box lies on the page.
    pub fn in_bounds(&self, geometry: &PageGeometry) -> bool {
        let (hw, hh) = self.half_extents(geometry);
        self.left - hw >= -1e-9
            && self.left + hw <= 1.0 + 1e-9
            && self.top - hh >= -1e-9
            && self.top + hh <= 1.0 + 1e-9
    }
}

/// Screen-space projection of a mark against a page geometry. Pure data for
/// the presentation layer; no overlay math reads it back.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Project a mark onto the scroll container. `y` includes the page's
/// container offset.
pub fn screen_rect(mark: &SignatureMark, geometry: &PageGeometry) -> ScreenRect {
    let (hw, hh) = mark.half_extents(geometry);
    let bw = 2.0 * hw * geometry.pixel_width;
    let bh = 2.0 * hh * geometry.pixel_height;
    ScreenRect {
        x: mark.left * geometry.pixel_width - bw / 2.0,
        y: geometry.offset_top + mark.top * geometry.pixel_height - bh / 2.0,
        width: bw,
        height: bh,
    }
}

fn clamp_axis(center: f64, half: f64) -> f64 {
    if half >= 0.5 {
        0.5
    } else {
        center.clamp(half, 1.0 - half)
    }
}

fn clamp_center(mark: &mut SignatureMark, geometry: &PageGeometry) {
    let (hw, hh) = mark.half_extents(geometry);
    mark.left = clamp_axis(mark.left, hw);
    mark.top = clamp_axis(mark.top, hh);
}

fn mutable_mark<'a>(
    session: &'a mut DocumentSession,
    id: Uuid,
) -> Result<&'a mut SignatureMark, String> {
    let mark = session.mark_mut(id).ok_or_else(|| "mark_not_found".to_string())?;
    if mark.deleted {
        return Err("mark_deleted".into());
    }
    if mark.locked {
        return Err("mark_locked".into());
    }
    Ok(mark)
}

fn require_owner(session: &DocumentSession, actor_email: &str) -> Result<(), String> {
    if session.is_owner(actor_email) {
        Ok(())
    } else {
        Err("not_document_owner".into())
    }
}

/// Place a new mark for a recipient. Owner-only; the target page must have
/// rendered geometry.
pub fn place_mark(
    session: &mut DocumentSession,
    actor_email: &str,
    page_index: usize,
    left: f64,
    top: f64,
    recipient_email: &str,
) -> Result<Uuid, String> {
    require_owner(session, actor_email)?;
    let geometry = session
        .geometry_for(page_index)
        .ok_or_else(|| "page_not_rendered".to_string())?
        .clone();
    let mut mark = SignatureMark::new(page_index, left, top, recipient_email);
    clamp_center(&mut mark, &geometry);
    let id = mark.id;
    session.marks.push(mark);
    Ok(id)
}

/// Move a mark by a pointer delta in screen pixels. When the pointer has
/// crossed into another page's rendered bounds, `hover_page_index` names it
/// and the normalized origin is re-baselined against that page's geometry so
/// the mark does not visibly jump.
pub fn handle_drag(
    session: &mut DocumentSession,
    actor_email: &str,
    id: Uuid,
    dx_px: f64,
    dy_px: f64,
    hover_page_index: usize,
) -> Result<(), String> {
    require_owner(session, actor_email)?;
    let from = {
        let mark = mutable_mark(session, id)?;
        mark.page_index
    };
    let from_geometry = session
        .geometry_for(from)
        .ok_or_else(|| "page_not_rendered".to_string())?
        .clone();
    let target_geometry = if hover_page_index == from {
        from_geometry.clone()
    } else {
        session
            .geometry_for(hover_page_index)
            .ok_or_else(|| "page_not_rendered".to_string())?
            .clone()
    };

    let mark = mutable_mark(session, id)?;
    // Work in container pixels so a page crossing keeps the same on-screen
    // point.
    let cx = mark.left * from_geometry.pixel_width + dx_px;
    let cy = from_geometry.offset_top + mark.top * from_geometry.pixel_height + dy_px;

    mark.page_index = hover_page_index;
    mark.left = cx / target_geometry.pixel_width;
    mark.top = (cy - target_geometry.offset_top) / target_geometry.pixel_height;
    clamp_center(mark, &target_geometry);
    Ok(())
}

/// Grow or shrink a mark. Pixel size changes directly; the position is
/// re-clamped afterwards so the box stays on-page.
pub fn handle_resize(
    session: &mut DocumentSession,
    actor_email: &str,
    id: Uuid,
    dw_px: f64,
    dh_px: f64,
) -> Result<(), String> {
    require_owner(session, actor_email)?;
    let page_index = mutable_mark(session, id)?.page_index;
    let geometry = session
        .geometry_for(page_index)
        .ok_or_else(|| "page_not_rendered".to_string())?
        .clone();
    let mark = mutable_mark(session, id)?;
    mark.width_px = (mark.width_px + dw_px).max(MIN_MARK_SIZE_PX);
    mark.height_px = (mark.height_px + dh_px).max(MIN_MARK_SIZE_PX);
    clamp_center(mark, &geometry);
    Ok(())
}

/// Cycle the mark one quarter turn and re-clamp with the swapped extents.
pub fn handle_rotate(
    session: &mut DocumentSession,
    actor_email: &str,
    id: Uuid,
) -> Result<Rotation, String> {
    require_owner(session, actor_email)?;
    let page_index = mutable_mark(session, id)?.page_index;
    let geometry = session
        .geometry_for(page_index)
        .ok_or_else(|| "page_not_rendered".to_string())?
        .clone();
    let mark = mutable_mark(session, id)?;
    mark.rotation = mark.rotation.step();
    clamp_center(mark, &geometry);
    Ok(mark.rotation)
}

/// Copy a mark near the center of the currently visible portion of the
/// active page, with a small random offset. Size and rotation carry over;
/// content and flags reset.
pub fn handle_duplicate(
    session: &mut DocumentSession,
    actor_email: &str,
    id: Uuid,
    visible_center_left: f64,
    visible_center_top: f64,
) -> Result<Uuid, String> {
    require_owner(session, actor_email)?;
    let source = session
        .mark(id)
        .ok_or_else(|| "mark_not_found".to_string())?
        .clone();
    let geometry = session
        .geometry_for(source.page_index)
        .ok_or_else(|| "page_not_rendered".to_string())?
        .clone();

    let mut rng = rand::thread_rng();
    let mut copy = SignatureMark::new(
        source.page_index,
        visible_center_left + rng.gen_range(-DUPLICATE_JITTER..=DUPLICATE_JITTER),
        visible_center_top + rng.gen_range(-DUPLICATE_JITTER..=DUPLICATE_JITTER),
        &source.owner_email,
    );
    copy.width_px = source.width_px;
    copy.height_px = source.height_px;
    copy.rotation = source.rotation;
    clamp_center(&mut copy, &geometry);
    let new_id = copy.id;
    session.marks.push(copy);
    Ok(new_id)
}

/// Soft delete: the visual element goes away but the record stays so open
/// references (a capture dialog on this mark, overlay bookkeeping) resolve.
pub fn handle_delete(
    session: &mut DocumentSession,
    actor_email: &str,
    id: Uuid,
) -> Result<(), String> {
    require_owner(session, actor_email)?;
    let mark = mutable_mark(session, id)?;
    mark.deleted = true;
    Ok(())
}

/// Attach captured content and commit the mark. Only the identity the mark
/// is reserved for may fill it; that covers the document owner filling their
/// own mark. Refusals mutate nothing.
pub fn fill_mark(
    session: &mut DocumentSession,
    actor_email: &str,
    id: Uuid,
    content: SignatureContent,
) -> Result<(), String> {
    let mark = mutable_mark(session, id)?;
    if mark.owner_email != actor_email {
        return Err("not_mark_owner".into());
    }
    mark.content = Some(content);
    mark.committed = true;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{DocumentSession, PageGeometry};

    const OWNER: &str = "owner@x.com";

    fn page(page_index: usize) -> PageGeometry {
        PageGeometry {
            page_index,
            unit_width: 612.0,
            unit_height: 792.0,
            pixel_width: 900.0,
            pixel_height: 1166.0,
            offset_top: page_index as f64 * 1178.0,
        }
    }

    fn session_with_pages(count: usize) -> DocumentSession {
        let mut session = DocumentSession::new(OWNER);
        for i in 0..count {
            session.record_geometry(page(i));
        }
        session
    }

    fn typed_content() -> SignatureContent {
        SignatureContent::Text {
            value: "Jane Doe".into(),
            font_family: "Default".into(),
            color_hex: "#111927".into(),
        }
    }

    #[test]
    fn test_drag_clamps_bounding_box_on_page() {
        let mut session = session_with_pages(1);
        let id = place_mark(&mut session, OWNER, 0, 0.5, 0.5, "alice@x.com").expect("place");
        handle_drag(&mut session, OWNER, id, 5000.0, -5000.0, 0).expect("drag");
        let mark = session.mark(id).expect("mark");
        let geometry = session.geometry_for(0).expect("geometry");
        assert!(mark.in_bounds(geometry));
        assert!(mark.left > 0.5, "should have clamped at the right edge");
        assert!(mark.top < 0.5, "should have clamped at the top edge");
    }

    #[test]
    fn test_sideways_mark_clamps_with_swapped_extents() {
        let mut session = session_with_pages(1);
        let id = place_mark(&mut session, OWNER, 0, 0.99, 0.5, "alice@x.com").expect("place");
        handle_rotate(&mut session, OWNER, id).expect("rotate");
        let mark = session.mark(id).expect("mark");
        let geometry = session.geometry_for(0).expect("geometry");
        assert_eq!(mark.rotation, Rotation::R90);
        assert!(mark.in_bounds(geometry));
        // A 200x80 mark turned sideways is 80 wide, so its center may sit
        // closer to the edge than the unrotated clamp would allow.
        let (hw, _) = mark.half_extents(geometry);
        assert!((mark.left + hw) <= 1.0 + 1e-9);
    }

    #[test]
    fn test_four_rotations_return_to_original() {
        let mut session = session_with_pages(1);
        let id = place_mark(&mut session, OWNER, 0, 0.97, 0.03, "alice@x.com").expect("place");
        let before = session.mark(id).expect("mark").clone();
        for _ in 0..4 {
            handle_rotate(&mut session, OWNER, id).expect("rotate");
        }
        let after = session.mark(id).expect("mark");
        let geometry = session.geometry_for(0).expect("geometry");
        assert_eq!(after.rotation, before.rotation);
        assert!(after.in_bounds(geometry));
        // Never less clamped: the center can only move toward the page.
        assert!((after.left - 0.5).abs() <= (before.left - 0.5).abs() + 1e-9);
        assert!((after.top - 0.5).abs() <= (before.top - 0.5).abs() + 1e-9);
    }

    #[test]
    fn test_cross_page_drag_rebaselines() {
        let mut session = session_with_pages(2);
        let id = place_mark(&mut session, OWNER, 0, 0.5, 0.9, "alice@x.com").expect("place");
        // Drag down far enough that the pointer sits over page 1.
        handle_drag(&mut session, OWNER, id, 0.0, 600.0, 1).expect("drag");
        let mark = session.mark(id).expect("mark");
        assert_eq!(mark.page_index, 1);
        // Same container y: 0.9 * 1166 + 600 = 1649.4; page 1 starts at 1178.
        let expected_top = (0.9 * 1166.0 + 600.0 - 1178.0) / 1166.0;
        assert!((mark.top - expected_top).abs() < 1e-9);
        assert!(mark.in_bounds(session.geometry_for(1).expect("geometry")));
    }

    #[test]
    fn test_resize_floors_at_minimum() {
        let mut session = session_with_pages(1);
        let id = place_mark(&mut session, OWNER, 0, 0.5, 0.5, "alice@x.com").expect("place");
        handle_resize(&mut session, OWNER, id, -1000.0, -1000.0).expect("resize");
        let mark = session.mark(id).expect("mark");
        assert_eq!(mark.width_px, MIN_MARK_SIZE_PX);
        assert_eq!(mark.height_px, MIN_MARK_SIZE_PX);
    }

    #[test]
    fn test_geometry_mutation_is_owner_only() {
        let mut session = session_with_pages(1);
        let id = place_mark(&mut session, OWNER, 0, 0.5, 0.5, "alice@x.com").expect("place");
        let err = handle_drag(&mut session, "alice@x.com", id, 10.0, 0.0, 0).unwrap_err();
        assert_eq!(err, "not_document_owner");
        assert_eq!(session.mark(id).expect("mark").left, 0.5);
    }

    #[test]
    fn test_fill_refused_for_wrong_identity() {
        let mut session = session_with_pages(1);
        let id = place_mark(&mut session, OWNER, 0, 0.5, 0.5, "a@x.com").expect("place");
        let err = fill_mark(&mut session, "b@y.com", id, typed_content()).unwrap_err();
        assert_eq!(err, "not_mark_owner");
        let mark = session.mark(id).expect("mark");
        assert!(mark.content.is_none());
        assert!(!mark.committed);
    }

    #[test]
    fn test_fill_by_matching_recipient_commits() {
        let mut session = session_with_pages(1);
        let id = place_mark(&mut session, OWNER, 0, 0.5, 0.5, "a@x.com").expect("place");
        fill_mark(&mut session, "a@x.com", id, typed_content()).expect("fill");
        let mark = session.mark(id).expect("mark");
        assert!(mark.committed);
        assert!(mark.content.is_some());
    }

    #[test]
    fn test_duplicate_inherits_shape_and_resets_flags() {
        let mut session = session_with_pages(1);
        let id = place_mark(&mut session, OWNER, 0, 0.5, 0.5, "a@x.com").expect("place");
        handle_resize(&mut session, OWNER, id, 40.0, 20.0).expect("resize");
        handle_rotate(&mut session, OWNER, id).expect("rotate");
        fill_mark(&mut session, "a@x.com", id, typed_content()).expect("fill");

        let copy_id = handle_duplicate(&mut session, OWNER, id, 0.5, 0.5).expect("duplicate");
        let copy = session.mark(copy_id).expect("copy");
        let original = session.mark(id).expect("original");
        assert_ne!(copy.id, original.id);
        assert_eq!(copy.width_px, original.width_px);
        assert_eq!(copy.height_px, original.height_px);
        assert_eq!(copy.rotation, original.rotation);
        assert!(!copy.committed);
        assert!(!copy.deleted);
        assert!(copy.content.is_none());
        assert!(copy.in_bounds(session.geometry_for(0).expect("geometry")));
    }

    #[test]
    fn test_delete_is_soft() {
        let mut session = session_with_pages(1);
        let id = place_mark(&mut session, OWNER, 0, 0.5, 0.5, "a@x.com").expect("place");
        handle_delete(&mut session, OWNER, id).expect("delete");
        assert!(session.mark(id).expect("record remains").deleted);
        assert_eq!(session.visible_marks().count(), 0);
        let err = handle_drag(&mut session, OWNER, id, 1.0, 1.0, 0).unwrap_err();
        assert_eq!(err, "mark_deleted");
    }

    #[test]
    fn test_screen_rect_swaps_extents_when_sideways() {
        let geometry = page(0);
        let mut mark = SignatureMark::new(0, 0.5, 0.5, "a@x.com");
        mark.rotation = Rotation::R90;
        let rect = screen_rect(&mark, &geometry);
        assert_eq!(rect.width, DEFAULT_MARK_HEIGHT_PX);
        assert_eq!(rect.height, DEFAULT_MARK_WIDTH_PX);
        assert!((rect.x - (450.0 - 40.0)).abs() < 1e-9);
        assert!((rect.y - (583.0 - 100.0)).abs() < 1e-9);
    }
}
