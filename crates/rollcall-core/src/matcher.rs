//! Nearest-neighbour identification against the enrolled gallery.

use crate::extractor::{ExtractError, FaceExtractor};
use crate::gallery::{GalleryError, GalleryStore};
use crate::types::{Embedding, Faces, GalleryEntry};
use rollcall_hw::Frame;
use thiserror::Error;

pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.5;
pub const DEFAULT_DUPLICATE_THRESHOLD: f32 = 0.5;
/// Identity reported for a face that matched nobody.
pub const UNKNOWN: &str = "Unknown";

#[derive(Debug, Clone)]
pub struct MatcherConfig {
    /// A probe closer than this to its nearest entry is that subject.
    pub match_threshold: f32,
    /// Registration is refused when the new face is within this of any entry.
    pub duplicate_threshold: f32,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            duplicate_threshold: DEFAULT_DUPLICATE_THRESHOLD,
        }
    }
}

/// Result of comparing a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Index of the closest entry, if the gallery is non-empty.
    pub nearest: Option<usize>,
    /// Distance to the closest entry (`f32::INFINITY` for an empty gallery).
    pub distance: f32,
    pub matched: bool,
}

/// Strategy for comparing a probe embedding against a gallery.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> MatchResult;
}

/// Euclidean distance on raw embeddings. Visits every gallery entry.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> MatchResult {
        let mut best = MatchResult {
            nearest: None,
            distance: f32::INFINITY,
            matched: false,
        };
        for (i, entry) in gallery.iter().enumerate() {
            let d = probe.euclidean_distance(&entry.embedding);
            if d < best.distance {
                best.distance = d;
                best.nearest = Some(i);
            }
        }
        best.matched = best.nearest.is_some() && best.distance < threshold;
        best
    }
}

#[derive(Error, Debug)]
pub enum RegisterError {
    #[error("No face detected. Please look at the camera.")]
    NoFace,
    #[error("Multiple faces detected ({0}). Please ensure only you are in frame.")]
    MultipleFaces(usize),
    #[error("User already registered as {existing}!")]
    DuplicateSubject { existing: String },
    #[error("name must not be empty")]
    EmptyName,
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Gallery(#[from] GalleryError),
}

#[derive(Error, Debug)]
pub enum RecognizeError {
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Incompatible(#[from] GalleryError),
}

/// Identification outcome for one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Recognition {
    /// No face was presented.
    NoFace,
    /// A face was presented but matched nobody, or the gallery is empty.
    Unknown,
    Match { name: String, confidence: f32 },
}

impl Recognition {
    /// `(identity, confidence)`: `None` for no face, `"Unknown"` for no match.
    pub fn as_pair(&self) -> (Option<&str>, f32) {
        match self {
            Recognition::NoFace => (None, 0.0),
            Recognition::Unknown => (Some(UNKNOWN), 0.0),
            Recognition::Match { name, confidence } => (Some(name), *confidence),
        }
    }

    pub fn confidence(&self) -> f32 {
        self.as_pair().1
    }

    /// The matched name, if any.
    pub fn name(&self) -> Option<&str> {
        match self {
            Recognition::Match { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// Registers and identifies faces against a persisted gallery.
pub struct FaceMatcher<E, S> {
    extractor: E,
    store: S,
    gallery: Vec<GalleryEntry>,
    config: MatcherConfig,
    matcher: EuclideanMatcher,
}

impl<E: FaceExtractor, S: GalleryStore> FaceMatcher<E, S> {
    /// Load the whole gallery from `store`.
    pub fn load(extractor: E, store: S, config: MatcherConfig) -> Result<Self, GalleryError> {
        let gallery = store.load()?;
        Ok(Self {
            extractor,
            store,
            gallery,
            config,
            matcher: EuclideanMatcher,
        })
    }

    pub fn gallery(&self) -> &[GalleryEntry] {
        &self.gallery
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Enroll the single face in `frame` under `name`.
    ///
    /// Nothing changes unless the face is unique and the rewritten gallery
    /// was persisted.
    pub fn register(&mut self, frame: &Frame, name: &str) -> Result<(), RegisterError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RegisterError::EmptyName);
        }

        let face = match Faces::from_vec(self.extractor.extract(frame)?) {
            Faces::None => return Err(RegisterError::NoFace),
            Faces::Multiple { ignored, .. } => return Err(RegisterError::MultipleFaces(ignored + 1)),
            Faces::Single(face) => face,
        };
        let embedding = face.embedding;
        self.check_compatible(&embedding)?;

        let nearest = self
            .matcher
            .compare(&embedding, &self.gallery, self.config.duplicate_threshold);
        // Registration tolerance is inclusive, unlike recognition.
        let duplicate = nearest
            .nearest
            .filter(|_| nearest.distance <= self.config.duplicate_threshold);
        if let Some(idx) = duplicate {
            let existing = self.gallery[idx].name.clone();
            tracing::warn!(name, %existing, distance = nearest.distance, "duplicate registration refused");
            return Err(RegisterError::DuplicateSubject { existing });
        }

        let mut next = self.gallery.clone();
        next.push(GalleryEntry {
            name: name.to_string(),
            embedding,
        });
        self.store.save(&next)?;
        self.gallery = next;

        tracing::info!(name, entries = self.gallery.len(), "subject registered");
        Ok(())
    }

    /// Identify the primary face in `frame`.
    ///
    /// The most confident face is the only one considered; others are ignored
    /// even if one of them would match.
    pub fn recognize(&mut self, frame: &Frame) -> Result<Recognition, RecognizeError> {
        if self.gallery.is_empty() {
            return Ok(Recognition::Unknown);
        }

        let faces = Faces::from_vec(self.extractor.extract(frame)?);
        if let Faces::Multiple { ignored, .. } = &faces {
            tracing::debug!(ignored, "several faces in frame; using the primary one");
        }
        let Some(face) = faces.into_primary() else {
            return Ok(Recognition::NoFace);
        };

        self.check_compatible(&face.embedding)?;

        let result = self
            .matcher
            .compare(&face.embedding, &self.gallery, self.config.match_threshold);
        tracing::trace!(distance = result.distance, matched = result.matched, "gallery comparison");

        Ok(match (result.matched, result.nearest) {
            (true, Some(idx)) => Recognition::Match {
                name: self.gallery[idx].name.clone(),
                confidence: 1.0 - result.distance,
            },
            _ => Recognition::Unknown,
        })
    }

    /// Probes must come from the same extractor as the gallery.
    fn check_compatible(&self, embedding: &Embedding) -> Result<(), GalleryError> {
        let Some(first) = self.gallery.first() else {
            return Ok(());
        };
        let reference = &first.embedding;
        if reference.dim() != embedding.dim() {
            return Err(GalleryError::DimensionMismatch {
                expected: reference.dim(),
                actual: embedding.dim(),
            });
        }
        if let (Some(expected), Some(actual)) = (&reference.model_version, &embedding.model_version) {
            if expected != actual {
                return Err(GalleryError::VersionMismatch {
                    expected: expected.clone(),
                    actual: actual.clone(),
                });
            }
        }
        Ok(())
    }
}
