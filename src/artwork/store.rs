//! The single published artwork snapshot plus the fallback images.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use log::info;
use parking_lot::RwLock;
use thiserror::Error;

use crate::{
    artwork::transcode::{TranscodeError, Transcoder},
    domain::{artwork::ArtworkSnapshot, hash::ContentHash},
};

#[derive(Debug, Error)]
#[error("failed to load default image {}: {source}", .path.display())]
pub struct DefaultImageError {
    pub path: PathBuf,
    #[source]
    pub source: TranscodeError,
}

/// Fallback images served until the first artwork is published.
#[derive(Debug, Clone)]
pub struct DefaultArtwork {
    pub jpeg: Arc<[u8]>,
    pub png: Arc<[u8]>,
}

impl DefaultArtwork {
    /// Normalizes both fallback files through the same transcoder as live
    /// artwork. The JPEG file provides the JPEG fallback and the PNG file the
    /// PNG fallback.
    pub fn load(
        transcoder: &Transcoder,
        jpeg_path: &Path,
        png_path: &Path,
    ) -> Result<Self, DefaultImageError> {
        let jpeg = transcoder
            .transcode_path(jpeg_path)
            .map_err(|source| DefaultImageError {
                path: jpeg_path.to_path_buf(),
                source,
            })?
            .jpeg;
        info!("loaded default JPEG cover from {}", jpeg_path.display());

        let png = transcoder
            .transcode_path(png_path)
            .map_err(|source| DefaultImageError {
                path: png_path.to_path_buf(),
                source,
            })?
            .png;
        info!("loaded default PNG cover from {}", png_path.display());

        Ok(Self { jpeg, png })
    }
}

/// Holds the current snapshot for concurrent readers.
///
/// The lock only ever guards an `Arc` clone or swap, so readers never wait on
/// image work and always see one whole snapshot.
pub struct ArtworkStore {
    defaults: DefaultArtwork,
    current: RwLock<Option<Arc<ArtworkSnapshot>>>,
}

impl ArtworkStore {
    pub fn new(defaults: DefaultArtwork) -> Self {
        Self {
            defaults,
            current: RwLock::new(None),
        }
    }

    pub fn publish(&self, snapshot: ArtworkSnapshot) {
        let next = Arc::new(snapshot);
        let previous = std::mem::replace(&mut *self.current.write(), Some(next));
        // The old snapshot is released outside the lock.
        drop(previous);
    }

    pub fn current(&self) -> Option<Arc<ArtworkSnapshot>> {
        self.current.read().clone()
    }

    pub fn current_hash(&self) -> Option<ContentHash> {
        self.current().map(|snapshot| snapshot.source_hash)
    }

    pub fn current_jpeg(&self) -> Arc<[u8]> {
        match self.current() {
            Some(snapshot) => Arc::clone(&snapshot.jpeg),
            None => self.default_jpeg(),
        }
    }

    pub fn current_png(&self) -> Arc<[u8]> {
        match self.current() {
            Some(snapshot) => Arc::clone(&snapshot.png),
            None => self.default_png(),
        }
    }

    pub fn default_jpeg(&self) -> Arc<[u8]> {
        Arc::clone(&self.defaults.jpeg)
    }

    pub fn default_png(&self) -> Arc<[u8]> {
        Arc::clone(&self.defaults.png)
    }
}
