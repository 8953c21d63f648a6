//! Gallery recognizer — nearest-neighbour matching against enrolled
//! embeddings.
//!
//! An [`Embedder`] turns an image into a fixed-length vector; the
//! [`Gallery`] holds labelled vectors; recognition picks the entry with
//! the smallest Euclidean distance.

use std::fs;
use std::path::{Path, PathBuf};

use image::DynamicImage;
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use facegrid_core::{PipelineError, PipelineResult, Recognition, Recognizer};

#[derive(Debug, Error)]
pub enum GalleryError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid gallery json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to decode image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("gallery has no entries")]
    Empty,

    #[error("entry {label:?} has dimension {found}, expected {expected}")]
    DimensionMismatch {
        label: String,
        expected: usize,
        found: usize,
    },
}

/// Turns a decoded image into an embedding vector.
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;

    fn embed(&self, image: &DynamicImage) -> Vec<f32>;
}

/// Grayscale thumbnail, mean-centred and L2-normalised.
///
/// Centring makes the embedding insensitive to uniform brightness shifts.
#[derive(Debug, Clone, Copy)]
pub struct ThumbnailEmbedder {
    side: u32,
}

impl ThumbnailEmbedder {
    pub fn new(side: u32) -> Self {
        Self { side: side.max(1) }
    }
}

impl Default for ThumbnailEmbedder {
    fn default() -> Self {
        Self::new(16)
    }
}

impl Embedder for ThumbnailEmbedder {
    fn dimension(&self) -> usize {
        (self.side * self.side) as usize
    }

    fn embed(&self, image: &DynamicImage) -> Vec<f32> {
        let thumb = image
            .resize_exact(self.side, self.side, FilterType::Triangle)
            .to_luma8();
        let mut v: Vec<f32> = thumb.pixels().map(|p| f32::from(p.0[0]) / 255.0).collect();

        let mean = v.iter().sum::<f32>() / v.len() as f32;
        v.iter_mut().for_each(|x| *x -= mean);

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub label: String,
    pub embedding: Vec<f32>,
}

/// Labelled embeddings, stored as JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Gallery {
    pub entries: Vec<GalleryEntry>,
}

impl Gallery {
    /// Load and validate a gallery file.
    pub fn load(path: &Path) -> Result<Self, GalleryError> {
        let content = fs::read_to_string(path).map_err(|source| GalleryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let gallery: Gallery = serde_json::from_str(&content)?;
        gallery.validate()?;
        info!(path = %path.display(), entries = gallery.entries.len(), "gallery loaded");
        Ok(gallery)
    }

    pub fn save(&self, path: &Path) -> Result<(), GalleryError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|source| GalleryError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Non-empty, and every embedding has the same length.
    pub fn validate(&self) -> Result<(), GalleryError> {
        let expected = self.dimension().ok_or(GalleryError::Empty)?;
        for entry in &self.entries {
            if entry.embedding.len() != expected {
                return Err(GalleryError::DimensionMismatch {
                    label: entry.label.clone(),
                    expected,
                    found: entry.embedding.len(),
                });
            }
        }
        Ok(())
    }

    pub fn dimension(&self) -> Option<usize> {
        self.entries.first().map(|e| e.embedding.len())
    }

    pub fn add(&mut self, label: impl Into<String>, embedding: Vec<f32>) {
        self.entries.push(GalleryEntry {
            label: label.into(),
            embedding,
        });
    }

    /// Entry closest to `embedding`, with its distance.
    pub fn nearest(&self, embedding: &[f32]) -> Option<(&GalleryEntry, f32)> {
        self.entries
            .iter()
            .map(|entry| (entry, euclidean(&entry.embedding, embedding)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }

    /// Enroll every decodable image under `dir`, labelled by file stem.
    ///
    /// Files that are not images are skipped with a warning.
    pub fn enroll_dir(dir: &Path, embedder: &dyn Embedder) -> Result<Self, GalleryError> {
        let mut gallery = Gallery::default();

        let mut paths = Vec::new();
        for entry in WalkDir::new(dir).follow_links(true) {
            let entry = entry.map_err(|e| GalleryError::Io {
                path: e.path().map_or_else(|| dir.to_path_buf(), Path::to_path_buf),
                source: e.into(),
            })?;
            if entry.file_type().is_file() {
                paths.push(entry.into_path());
            }
        }
        paths.sort();

        for path in paths {
            let Some(label) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let image = match image::open(&path) {
                Ok(image) => image,
                Err(image::ImageError::Unsupported(_)) => {
                    warn!(path = %path.display(), "not an image, skipped");
                    continue;
                }
                Err(source) => return Err(GalleryError::Image { path, source }),
            };
            debug!(%label, path = %path.display(), "enrolled");
            gallery.add(label, embedder.embed(&image));
        }

        gallery.validate()?;
        Ok(gallery)
    }
}

fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Recognizer backed by a gallery and an embedder.
pub struct GalleryRecognizer {
    gallery: Gallery,
    embedder: Box<dyn Embedder>,
}

impl GalleryRecognizer {
    /// Fails if the gallery is empty or its dimension differs from the embedder's.
    pub fn new(gallery: Gallery, embedder: Box<dyn Embedder>) -> Result<Self, GalleryError> {
        gallery.validate()?;
        if let Some(found) = gallery.dimension()
            && found != embedder.dimension()
        {
            return Err(GalleryError::DimensionMismatch {
                label: gallery.entries[0].label.clone(),
                expected: embedder.dimension(),
                found,
            });
        }
        Ok(Self { gallery, embedder })
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }
}

impl Recognizer for GalleryRecognizer {
    fn recognize(&self, image: &[u8]) -> PipelineResult<Recognition> {
        let decoded = image::load_from_memory(image)
            .map_err(|e| PipelineError::Recognition(format!("decode: {e}")))?;
        let embedding = self.embedder.embed(&decoded);

        let (entry, distance) = self
            .gallery
            .nearest(&embedding)
            .ok_or_else(|| PipelineError::Recognition("empty gallery".to_string()))?;
        Ok(Recognition {
            label: entry.label.clone(),
            distance,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{GrayImage, ImageFormat, Luma};

    use super::*;

    fn png(f: impl Fn(u32, u32) -> u8) -> Vec<u8> {
        let img = GrayImage::from_fn(32, 32, |x, y| Luma([f(x, y)]));
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageLuma8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    fn horizontal(offset: u8) -> Vec<u8> {
        png(move |x, _| (x * 4) as u8 + offset)
    }

    fn vertical(offset: u8) -> Vec<u8> {
        png(move |_, y| (y * 4) as u8 + offset)
    }

    fn enrolled() -> GalleryRecognizer {
        let embedder = ThumbnailEmbedder::new(8);
        let mut gallery = Gallery::default();
        for (label, bytes) in [("alice", horizontal(0)), ("bob", vertical(0))] {
            let image = image::load_from_memory(&bytes).unwrap();
            gallery.add(label, embedder.embed(&image));
        }
        GalleryRecognizer::new(gallery, Box::new(embedder)).unwrap()
    }

    #[test]
    fn embedding_is_normalised() {
        let embedder = ThumbnailEmbedder::new(4);
        let image = image::load_from_memory(&horizontal(0)).unwrap();
        let v = embedder.embed(&image);

        assert_eq!(v.len(), embedder.dimension());
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn flat_image_embeds_to_zero_vector() {
        let embedder = ThumbnailEmbedder::new(4);
        let image = image::load_from_memory(&png(|_, _| 128)).unwrap();
        assert!(embedder.embed(&image).iter().all(|x| x.abs() < 1e-6));
    }

    #[test]
    fn recognizes_nearest_label() {
        let recognizer = enrolled();

        let result = recognizer.recognize(&horizontal(20)).unwrap();
        assert_eq!(result.label, "alice");
        assert!(result.distance < 0.1);

        let result = recognizer.recognize(&vertical(10)).unwrap();
        assert_eq!(result.label, "bob");
    }

    #[test]
    fn recognition_is_deterministic() {
        let recognizer = enrolled();
        let image = horizontal(5);
        assert_eq!(
            recognizer.recognize(&image).unwrap(),
            recognizer.recognize(&image).unwrap()
        );
    }

    #[test]
    fn undecodable_input_is_a_recognition_error() {
        let err = enrolled().recognize(b"definitely not an image").unwrap_err();
        assert!(matches!(err, PipelineError::Recognition(_)));
    }

    #[test]
    fn empty_gallery_is_rejected() {
        let err = GalleryRecognizer::new(Gallery::default(), Box::new(ThumbnailEmbedder::new(4)))
            .err()
            .unwrap();
        assert!(matches!(err, GalleryError::Empty));
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let mut gallery = Gallery::default();
        gallery.add("alice", vec![0.0; 4]);
        let err = GalleryRecognizer::new(gallery.clone(), Box::new(ThumbnailEmbedder::new(4)))
            .err()
            .unwrap();
        assert!(matches!(err, GalleryError::DimensionMismatch { expected: 16, found: 4, .. }));

        gallery.add("bob", vec![0.0; 5]);
        assert!(matches!(
            gallery.validate(),
            Err(GalleryError::DimensionMismatch { found: 5, .. })
        ));
    }

    #[test]
    fn gallery_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.json");

        let mut gallery = Gallery::default();
        gallery.add("alice", vec![0.5, -0.5]);
        gallery.add("bob", vec![-0.5, 0.5]);
        gallery.save(&path).unwrap();

        assert_eq!(Gallery::load(&path).unwrap(), gallery);
    }

    #[test]
    fn load_reports_missing_and_invalid_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Gallery::load(&dir.path().join("absent.json")),
            Err(GalleryError::Io { .. })
        ));

        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(Gallery::load(&path), Err(GalleryError::Json(_))));
    }

    #[test]
    fn enroll_dir_labels_by_stem_and_skips_non_images() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("alice.png"), horizontal(0)).unwrap();
        fs::write(dir.path().join("bob.png"), vertical(0)).unwrap();
        fs::write(dir.path().join("README.txt"), "enrolled faces").unwrap();

        let embedder = ThumbnailEmbedder::new(8);
        let gallery = Gallery::enroll_dir(dir.path(), &embedder).unwrap();

        let labels: Vec<_> = gallery.entries.iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, vec!["alice", "bob"]);
        assert_eq!(gallery.dimension(), Some(64));
    }

    #[test]
    fn enroll_empty_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = Gallery::enroll_dir(dir.path(), &ThumbnailEmbedder::default()).unwrap_err();
        assert!(matches!(err, GalleryError::Empty));
    }
}
