//! Headless signing core: render document pages to addressable surfaces,
//! place and adjust signature marks on top of them, capture typed, drawn or
//! uploaded signature content, and bake committed marks permanently into the
//! PDF byte stream.

pub mod features;
pub mod session;

pub use features::capture::{CaptureMode, CaptureSession, SignatureContent};
pub use features::embed::{finalize, FinalizeOutcome};
pub use features::fonts::FontRegistry;
pub use features::overlay::{Rotation, SignatureMark};
pub use features::renderer::{PagePaint, PageRenderer, RenderRequest};
pub use features::storage::{DocumentStore, FileStore};
pub use features::CancelToken;
pub use session::{DocumentSession, DocumentSource, MediaKind, PageGeometry};
