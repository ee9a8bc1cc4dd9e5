use std::sync::Arc;

use super::hash::ContentHash;

/// Artwork bytes as delivered by a source, before any decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawArtwork {
    pub bytes: Vec<u8>,
    pub content_hash: ContentHash,
}

impl RawArtwork {
    pub fn new(bytes: Vec<u8>) -> Self {
        let content_hash = ContentHash::from_bytes(&bytes);
        Self {
            bytes,
            content_hash,
        }
    }
}

/// Both served encodings of one artwork, ready to hand out to clients.
///
/// Image bytes are reference counted so readers can hold on to them without
/// copying or keeping the store locked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtworkSnapshot {
    pub source_hash: ContentHash,
    pub jpeg: Arc<[u8]>,
    pub png: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    pub jpeg_quality: u8,
}
