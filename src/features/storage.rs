use memmap2::Mmap;
use sha2::{digest::Digest, Sha256};
use std::fs::{self, File};
use std::path::PathBuf;

use crate::session::{DocumentSession, DocumentSource};

#[cfg(test)]
use std::sync::{Mutex, OnceLock};

#[cfg(test)]
pub fn test_env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

/// Write bytes, get back a retrievable locator. The transport behind the
/// locator is the collaborator's business.
pub trait DocumentStore {
    fn put(&self, bytes: &[u8]) -> Result<String, String>;
    fn get(&self, locator: &str) -> Result<Vec<u8>, String>;
}

pub fn preferred_store_dir() -> PathBuf {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Ok(custom) = std::env::var("INNSIGLI_STORE_DIR") {
        candidates.push(PathBuf::from(custom));
    }
    if let Ok(tmpdir) = std::env::var("TMPDIR") {
        candidates.push(PathBuf::from(tmpdir));
    }
    candidates.push(std::env::temp_dir());

    for dir in candidates {
        if let Ok(meta) = fs::metadata(&dir) {
            if meta.is_dir() {
                return dir;
            }
        }
    }
    std::env::temp_dir()
}

/// Content-addressed file store: the locator is the sha-256 of the bytes, so
/// identical documents land on the same name and a successful `put` never
/// clobbers a different document.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn in_preferred_dir() -> Self {
        Self::new(preferred_store_dir())
    }

    fn path_for(&self, locator: &str) -> Result<PathBuf, String> {
        if locator.is_empty() || !locator.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("invalid_locator:{locator}"));
        }
        Ok(self.root.join(locator))
    }
}

impl DocumentStore for FileStore {
    fn put(&self, bytes: &[u8]) -> Result<String, String> {
        let locator = format!("{:x}", Sha256::digest(bytes));
        fs::create_dir_all(&self.root).map_err(|e| format!("store_dir_failed:{e}"))?;
        let path = self.path_for(&locator)?;
        fs::write(&path, bytes).map_err(|e| format!("store_write_failed:{e}"))?;
        Ok(locator)
    }

    fn get(&self, locator: &str) -> Result<Vec<u8>, String> {
        let path = self.path_for(locator)?;
        let file = File::open(&path).map_err(|e| format!("store_open_failed:{e}"))?;
        // Stored documents can be large; map instead of buffered reads.
        let map = unsafe { Mmap::map(&file) }.map_err(|e| format!("store_map_failed:{e}"))?;
        Ok(map.to_vec())
    }
}

/// Fetch the session's document bytes from wherever they live.
pub fn resolve_source(
    session: &DocumentSession,
    store: &dyn DocumentStore,
) -> Result<Vec<u8>, String> {
    match session.source.as_ref() {
        Some(DocumentSource::Buffer(bytes)) => Ok(bytes.clone()),
        Some(DocumentSource::Locator(locator)) => store.get(locator),
        None => Err("no_document_open".into()),
    }
}
