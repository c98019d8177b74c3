//! Path resolution seam: where tag bytes come from.

use std::collections::HashMap;
use std::io;

use crate::tag::TagClass;

/// External collaborator mapping logical tag paths to readable byte sources.
///
/// `load` returns `Ok(None)` when no tag exists at `path` with the requested
/// class; `probe_class` lets the compiler distinguish "not found at all" from
/// "found under a different class" when reporting errors.
pub trait TagSource {
    fn load(&mut self, path: &str, class: TagClass) -> io::Result<Option<Vec<u8>>>;

    fn probe_class(&self, path: &str) -> Option<TagClass>;
}

/// In-memory tag source, keyed by (path, class).
#[derive(Default)]
pub struct MemoryTagSource {
    tags: HashMap<(String, TagClass), Vec<u8>>,
}

impl MemoryTagSource {
    pub fn new() -> MemoryTagSource {
        MemoryTagSource::default()
    }

    pub fn insert(&mut self, path: &str, class: TagClass, bytes: Vec<u8>) {
        self.tags.insert((path.to_owned(), class), bytes);
    }
}

impl TagSource for MemoryTagSource {
    fn load(&mut self, path: &str, class: TagClass) -> io::Result<Option<Vec<u8>>> {
        Ok(self.tags.get(&(path.to_owned(), class)).cloned())
    }

    fn probe_class(&self, path: &str) -> Option<TagClass> {
        self.tags
            .keys()
            .filter(|(p, _)| p == path)
            .map(|&(_, class)| class)
            .next()
    }
}
