use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt,
};

use bytes::Bytes;

/// Opaque handle to bytes held by a [`BlobStore`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BlobUrl(String);

impl BlobUrl {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug)]
pub struct Blob {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

/// Object-URL registry. Every created URL must be revoked exactly once.
pub trait BlobStore {
    fn create(&self, bytes: Bytes, content_type: Option<String>) -> BlobUrl;

    fn get(&self, url: &BlobUrl) -> Option<Blob>;

    /// Returns false if the URL was unknown or already revoked.
    fn revoke(&self, url: &BlobUrl) -> bool;
}

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RefCell<HashMap<BlobUrl, Blob>>,
    next_id: Cell<u64>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live(&self) -> usize {
        self.blobs.borrow().len()
    }
}

impl BlobStore for MemoryBlobStore {
    fn create(&self, bytes: Bytes, content_type: Option<String>) -> BlobUrl {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let url = BlobUrl(format!("blob:marshalplay/{}", id));
        self.blobs.borrow_mut().insert(
            url.clone(),
            Blob {
                bytes,
                content_type,
            },
        );
        url
    }

    fn get(&self, url: &BlobUrl) -> Option<Blob> {
        self.blobs.borrow().get(url).cloned()
    }

    fn revoke(&self, url: &BlobUrl) -> bool {
        self.blobs.borrow_mut().remove(url).is_some()
    }
}
