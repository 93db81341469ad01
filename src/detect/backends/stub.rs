use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;

/// Stub backend for tests and model-free runs.
///
/// With a configured detection list it always returns that list (the
/// substitution point for tests). Without one it derives a small,
/// stable car count from a pixel hash, so the daemon produces
/// deterministic output for a given image even when no model file is
/// available.
pub struct StubBackend {
    fixed: Option<Vec<Detection>>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self { fixed: None }
    }

    /// Always return the given detections.
    pub fn with_detections(detections: Vec<Detection>) -> Self {
        Self {
            fixed: Some(detections),
        }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, pixels: &[u8], _width: u32, _height: u32) -> Result<Vec<Detection>> {
        if let Some(fixed) = &self.fixed {
            return Ok(fixed.clone());
        }

        let hash: [u8; 32] = Sha256::digest(pixels).into();
        let cars = u32::from(hash[0] % 8);

        Ok((0..cars)
            .map(|i| Detection {
                x: i as f32 / 8.0,
                y: 0.5,
                w: 0.1,
                h: 0.1,
                confidence: 0.9,
                class_id: 2,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_detections_are_returned_verbatim() {
        let detections = vec![Detection {
            x: 0.0,
            y: 0.0,
            w: 0.5,
            h: 0.5,
            confidence: 0.8,
            class_id: 7,
        }];
        let mut backend = StubBackend::with_detections(detections.clone());

        let out = backend.detect(&[0u8; 12], 2, 2).expect("detect");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].class_id, 7);
    }

    #[test]
    fn hash_derived_count_is_stable() {
        let mut backend = StubBackend::new();
        let first = backend.detect(b"same pixels", 1, 1).expect("detect");
        let second = backend.detect(b"same pixels", 1, 1).expect("detect");
        assert_eq!(first.len(), second.len());
        assert!(first.len() < 8);
        assert!(first.iter().all(|d| d.class_id == 2));
    }
}
