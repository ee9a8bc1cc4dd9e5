//! Decoding, resizing and re-encoding of artwork.
//!
//! Everything here is a pure function of the input bytes and the settings
//! fixed at startup, so it can run on its own worker thread.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, Sender};
use image::{
    DynamicImage, ExtendedColorType, ImageEncoder, Rgb, RgbImage,
    codecs::{
        jpeg::JpegEncoder,
        png::{CompressionType, FilterType as PngFilter, PngEncoder},
    },
    imageops::{self, FilterType},
};
use log::debug;
use serde::Deserialize;
use thiserror::Error;

use crate::domain::{
    artwork::{ArtworkSnapshot, RawArtwork},
    hash::ContentHash,
};

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("failed to decode artwork: {0}")]
    Decode(String),

    #[error("failed to encode artwork: {0}")]
    Encode(#[source] image::ImageError),

    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How artwork with a different aspect ratio is fitted to the target size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeMode {
    /// Scale each axis independently.
    #[default]
    Stretch,
    /// Keep the aspect ratio and pad with black bars.
    Fit,
    /// Keep the aspect ratio and crop the overflow around the centre.
    Fill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranscodeSettings {
    pub width: u32,
    pub height: u32,
    pub jpeg_quality: u8,
    pub resize: ResizeMode,
}

#[derive(Debug, Clone)]
pub struct Transcoder {
    settings: TranscodeSettings,
}

impl Transcoder {
    pub fn new(settings: TranscodeSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &TranscodeSettings {
        &self.settings
    }

    pub fn transcode(&self, raw: &RawArtwork) -> Result<ArtworkSnapshot, TranscodeError> {
        let decoded = decode(&raw.bytes)?;
        let resized = self.resize(decoded);

        let jpeg = encode_jpeg(&resized, self.settings.jpeg_quality)?;
        let png = encode_png(&resized)?;

        Ok(ArtworkSnapshot {
            source_hash: raw.content_hash,
            jpeg: Arc::from(jpeg),
            png: Arc::from(png),
            width: resized.width(),
            height: resized.height(),
            jpeg_quality: self.settings.jpeg_quality,
        })
    }

    /// Reads an image file from disk and transcodes it.
    pub fn transcode_path(&self, path: &Path) -> Result<ArtworkSnapshot, TranscodeError> {
        let bytes = std::fs::read(path).map_err(|source| TranscodeError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        self.transcode(&RawArtwork::new(bytes))
    }

    fn resize(&self, image: DynamicImage) -> RgbImage {
        let TranscodeSettings { width, height, .. } = self.settings;

        match self.settings.resize {
            ResizeMode::Stretch => image.resize_exact(width, height, FilterType::Lanczos3).to_rgb8(),
            ResizeMode::Fill => image.resize_to_fill(width, height, FilterType::Lanczos3).to_rgb8(),
            ResizeMode::Fit => {
                let scaled = image.resize(width, height, FilterType::Lanczos3).to_rgb8();
                let mut canvas = RgbImage::from_pixel(width, height, Rgb([0, 0, 0]));
                let x = (width - scaled.width()) / 2;
                let y = (height - scaled.height()) / 2;
                imageops::overlay(&mut canvas, &scaled, i64::from(x), i64::from(y));
                canvas
            }
        }
    }
}

fn looks_like_jpeg(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0xff && bytes[1] == 0xd8
}

/// The JPEG decoder fills missing scan data with grey instead of failing, so
/// a payload cut off before its end-of-image marker is rejected up front.
///
/// Only the marker at the very end counts, since embedded thumbnails carry
/// their own. Trailing zero or whitespace padding is allowed.
fn jpeg_is_truncated(bytes: &[u8]) -> bool {
    let end = bytes
        .iter()
        .rposition(|&byte| byte != 0x00 && !byte.is_ascii_whitespace())
        .map_or(0, |last| last + 1);
    !bytes[..end].ends_with(&[0xff, 0xd9])
}

fn decode(bytes: &[u8]) -> Result<DynamicImage, TranscodeError> {
    if bytes.is_empty() {
        return Err(TranscodeError::Decode("empty payload".into()));
    }
    if looks_like_jpeg(bytes) && jpeg_is_truncated(bytes) {
        return Err(TranscodeError::Decode("truncated jpeg".into()));
    }

    let image =
        image::load_from_memory(bytes).map_err(|e| TranscodeError::Decode(e.to_string()))?;
    debug!(
        "decoded artwork {}x{} from {} bytes",
        image.width(),
        image.height(),
        bytes.len()
    );

    // Alpha is flattened away; neither served format keeps it.
    Ok(DynamicImage::ImageRgb8(image.to_rgb8()))
}

fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, TranscodeError> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode_image(image)
        .map_err(TranscodeError::Encode)?;
    Ok(out)
}

fn encode_png(image: &RgbImage) -> Result<Vec<u8>, TranscodeError> {
    let mut out = Vec::new();
    PngEncoder::new_with_quality(&mut out, CompressionType::Best, PngFilter::Adaptive)
        .write_image(
            image.as_raw(),
            image.width(),
            image.height(),
            ExtendedColorType::Rgb8,
        )
        .map_err(TranscodeError::Encode)?;
    Ok(out)
}

/// Work item for the transcode worker.
#[derive(Debug)]
pub struct TranscodeJob {
    pub generation: u64,
    pub artwork: RawArtwork,
}

#[derive(Debug)]
pub struct TranscodeOutcome {
    pub generation: u64,
    pub hash: ContentHash,
    pub result: Result<ArtworkSnapshot, TranscodeError>,
}

/// Spawns the thread that transcodes jobs one by one, in the order they were
/// submitted. It exits once every job sender is dropped.
pub fn spawn_worker(
    transcoder: Transcoder,
    jobs: Receiver<TranscodeJob>,
    outcomes: Sender<TranscodeOutcome>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        for job in jobs {
            let hash = job.artwork.content_hash;
            debug!("transcoding artwork {}", hash.short());

            let outcome = TranscodeOutcome {
                generation: job.generation,
                hash,
                result: transcoder.transcode(&job.artwork),
            };
            if outcomes.send(outcome).is_err() {
                break;
            }
        }
        debug!("transcode worker stopped");
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Cursor;

    use image::{GenericImageView, ImageFormat, Rgba, RgbaImage};

    use super::*;

    pub(crate) fn settings(width: u32, height: u32) -> TranscodeSettings {
        TranscodeSettings {
            width,
            height,
            jpeg_quality: 80,
            resize: ResizeMode::Stretch,
        }
    }

    pub(crate) fn png_bytes(width: u32, height: u32, shade: u8) -> Vec<u8> {
        let image = RgbaImage::from_pixel(width, height, Rgba([shade, 40, 200, 255]));
        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(image)
            .write_to(&mut cursor, ImageFormat::Png)
            .expect("png encoding should succeed");
        cursor.into_inner()
    }

    pub(crate) fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, Rgb([90, 140, 210]));
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, 90)
            .encode_image(&image)
            .expect("jpeg encoding should succeed");
        out
    }

    fn transcoder(resize: ResizeMode) -> Transcoder {
        Transcoder::new(TranscodeSettings {
            resize,
            ..settings(64, 32)
        })
    }

    #[test]
    fn png_input_produces_both_outputs_at_target_size() -> anyhow::Result<()> {
        let raw = RawArtwork::new(png_bytes(300, 300, 10));
        let snapshot = transcoder(ResizeMode::Stretch).transcode(&raw)?;

        assert_eq!(snapshot.source_hash, raw.content_hash);
        assert_eq!((snapshot.width, snapshot.height), (64, 32));
        assert_eq!(snapshot.jpeg_quality, 80);

        let jpeg = image::load_from_memory_with_format(&snapshot.jpeg, ImageFormat::Jpeg)?;
        let png = image::load_from_memory_with_format(&snapshot.png, ImageFormat::Png)?;
        assert_eq!(jpeg.dimensions(), (64, 32));
        assert_eq!(png.dimensions(), (64, 32));
        Ok(())
    }

    #[test]
    fn jpeg_input_is_accepted() -> anyhow::Result<()> {
        let raw = RawArtwork::new(jpeg_bytes(120, 90));
        let snapshot = transcoder(ResizeMode::Stretch).transcode(&raw)?;

        assert_eq!((snapshot.width, snapshot.height), (64, 32));
        Ok(())
    }

    #[test]
    fn every_resize_mode_hits_the_exact_target() -> anyhow::Result<()> {
        let raw = RawArtwork::new(png_bytes(50, 200, 10));

        for mode in [ResizeMode::Stretch, ResizeMode::Fit, ResizeMode::Fill] {
            let snapshot = transcoder(mode).transcode(&raw)?;
            let png = image::load_from_memory(&snapshot.png)?;
            assert_eq!(png.dimensions(), (64, 32), "mode {mode:?}");
        }
        Ok(())
    }

    #[test]
    fn fit_pads_with_black_bars() -> anyhow::Result<()> {
        // A tall image fitted into a wide box leaves the left edge empty.
        let raw = RawArtwork::new(png_bytes(10, 100, 255));
        let snapshot = transcoder(ResizeMode::Fit).transcode(&raw)?;

        let png = image::load_from_memory(&snapshot.png)?.to_rgb8();
        assert_eq!(png.get_pixel(0, 16), &Rgb([0, 0, 0]));
        assert_ne!(png.get_pixel(32, 16), &Rgb([0, 0, 0]));
        Ok(())
    }

    #[test]
    fn empty_payload_is_a_decode_error() {
        let result = transcoder(ResizeMode::Stretch).transcode(&RawArtwork::new(Vec::new()));

        assert!(matches!(result, Err(TranscodeError::Decode(_))));
    }

    #[test]
    fn truncated_png_is_a_decode_error() {
        let mut bytes = png_bytes(40, 40, 10);
        bytes.truncate(bytes.len() / 2);

        let result = transcoder(ResizeMode::Stretch).transcode(&RawArtwork::new(bytes));

        assert!(matches!(result, Err(TranscodeError::Decode(_))));
    }

    #[test]
    fn truncated_jpeg_is_a_decode_error() {
        let mut bytes = jpeg_bytes(40, 40);
        bytes.truncate(bytes.len() - 10);

        let result = transcoder(ResizeMode::Stretch).transcode(&RawArtwork::new(bytes));

        assert!(matches!(result, Err(TranscodeError::Decode(_))));
    }

    /// Splices an APP1 segment holding a tiny SOI/EOI pair after the SOI.
    fn with_embedded_thumbnail(jpeg: &[u8]) -> Vec<u8> {
        let mut bytes = jpeg[..2].to_vec();
        bytes.extend_from_slice(&[0xff, 0xe1, 0x00, 0x06, 0xff, 0xd8, 0xff, 0xd9]);
        bytes.extend_from_slice(&jpeg[2..]);
        bytes
    }

    #[test]
    fn truncated_jpeg_with_embedded_thumbnail_is_a_decode_error() {
        let mut bytes = with_embedded_thumbnail(&jpeg_bytes(40, 40));
        bytes.truncate(bytes.len() - 10);

        assert!(jpeg_is_truncated(&bytes));
        let result = transcoder(ResizeMode::Stretch).transcode(&RawArtwork::new(bytes));
        assert!(matches!(result, Err(TranscodeError::Decode(_))));
    }

    #[test]
    fn complete_jpeg_end_marker_tolerates_padding() {
        let complete = with_embedded_thumbnail(&jpeg_bytes(8, 8));
        let mut padded = jpeg_bytes(8, 8);
        padded.extend_from_slice(&[0x00, 0x00, b'\n']);

        assert!(!jpeg_is_truncated(&complete));
        assert!(!jpeg_is_truncated(&padded));
        assert!(jpeg_is_truncated(&[0xff, 0xd8, 0x00, 0x00]));
    }

    #[test]
    fn non_image_bytes_are_a_decode_error() {
        let raw = RawArtwork::new(b"definitely-not-an-image".to_vec());

        let result = transcoder(ResizeMode::Stretch).transcode(&raw);

        assert!(matches!(result, Err(TranscodeError::Decode(_))));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();

        let result = transcoder(ResizeMode::Stretch).transcode_path(&dir.path().join("nope.png"));

        assert!(matches!(result, Err(TranscodeError::Read { .. })));
    }

    #[test]
    fn worker_answers_jobs_in_order() {
        let (jobs_tx, jobs_rx) = crossbeam_channel::unbounded();
        let (outcomes_tx, outcomes_rx) = crossbeam_channel::unbounded();
        let handle = spawn_worker(transcoder(ResizeMode::Stretch), jobs_rx, outcomes_tx);

        let good = RawArtwork::new(png_bytes(8, 8, 1));
        let bad = RawArtwork::new(vec![1, 2, 3]);
        for (generation, artwork) in [(0, good.clone()), (1, bad.clone())] {
            jobs_tx.send(TranscodeJob { generation, artwork }).unwrap();
        }
        drop(jobs_tx);
        handle.join().unwrap();

        let outcomes: Vec<_> = outcomes_rx.iter().collect();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].hash, good.content_hash);
        assert!(outcomes[0].result.is_ok());
        assert_eq!(outcomes[1].generation, 1);
        assert!(outcomes[1].result.is_err());
    }
}
