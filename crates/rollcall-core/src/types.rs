use serde::{Deserialize, Serialize};

/// A 2D point in frame pixel coordinates.
pub type Point = (f32, f32);

/// Bounding box for a detected face, with optional five-point landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[Point; 5]>,
}

impl FaceBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Square box around the same centre, grown by `factor` on the long side.
    pub fn expanded_square(&self, factor: f32) -> FaceBox {
        let side = self.width.max(self.height) * factor;
        let cx = self.x + self.width / 2.0;
        let cy = self.y + self.height / 2.0;
        FaceBox {
            x: cx - side / 2.0,
            y: cy - side / 2.0,
            width: side,
            height: side,
            ..self.clone()
        }
    }
}

/// Face embedding vector. Dimensionality is fixed by the extractor that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Extractor version that produced this embedding. Embeddings from
    /// different versions are not comparable.
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance between two embeddings of equal dimension.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// One enrolled subject in the gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub name: String,
    pub embedding: Embedding,
}

/// Ordered facial landmark points for one face, in frame coordinates.
///
/// Derived per frame and discarded after the eye-aspect ratio is computed.
#[derive(Debug, Clone, PartialEq)]
pub struct LandmarkSet {
    pub points: Vec<Point>,
}

impl LandmarkSet {
    pub fn get(&self, idx: usize) -> Option<Point> {
        self.points.get(idx).copied()
    }
}

/// Output of the embedding extractor for one face.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: FaceBox,
    pub embedding: Embedding,
}

/// How many faces a stage saw, with the primary face singled out.
///
/// Detectors return faces ordered by confidence; the first one is primary.
#[derive(Debug, Clone, PartialEq)]
pub enum Faces<T> {
    None,
    Single(T),
    Multiple { primary: T, ignored: usize },
}

impl<T> Faces<T> {
    pub fn from_vec(faces: Vec<T>) -> Self {
        let count = faces.len();
        let mut iter = faces.into_iter();
        match iter.next() {
            None => Faces::None,
            Some(only) if count == 1 => Faces::Single(only),
            Some(primary) => Faces::Multiple {
                primary,
                ignored: count - 1,
            },
        }
    }

    pub fn count(&self) -> usize {
        match self {
            Faces::None => 0,
            Faces::Single(_) => 1,
            Faces::Multiple { ignored, .. } => ignored + 1,
        }
    }

    pub fn primary(&self) -> Option<&T> {
        match self {
            Faces::None => None,
            Faces::Single(face) | Faces::Multiple { primary: face, .. } => Some(face),
        }
    }

    pub fn into_primary(self) -> Option<T> {
        match self {
            Faces::None => None,
            Faces::Single(face) | Faces::Multiple { primary: face, .. } => Some(face),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_identical_is_zero() {
        let a = Embedding::new(vec![0.1, -0.2, 0.3]);
        assert!(a.euclidean_distance(&a).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_known_value() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_faces_from_vec() {
        assert_eq!(Faces::<u8>::from_vec(vec![]), Faces::None);
        assert_eq!(Faces::from_vec(vec![7]), Faces::Single(7));
        assert_eq!(
            Faces::from_vec(vec![7, 8, 9]),
            Faces::Multiple { primary: 7, ignored: 2 }
        );
    }

    #[test]
    fn test_faces_primary_is_first() {
        let faces = Faces::from_vec(vec!["a", "b"]);
        assert_eq!(faces.count(), 2);
        assert_eq!(faces.primary(), Some(&"a"));
        assert_eq!(faces.into_primary(), Some("a"));
    }

    #[test]
    fn test_expanded_square_keeps_centre() {
        let b = FaceBox {
            x: 10.0, y: 20.0, width: 40.0, height: 60.0,
            confidence: 0.9, landmarks: None,
        };
        let sq = b.expanded_square(1.5);
        assert!((sq.width - 90.0).abs() < 1e-6);
        assert!((sq.height - 90.0).abs() < 1e-6);
        assert!((sq.x + sq.width / 2.0 - 30.0).abs() < 1e-6);
        assert!((sq.y + sq.height / 2.0 - 50.0).abs() < 1e-6);
    }
}
