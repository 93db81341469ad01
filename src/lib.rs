//! Traffic density analyzer.
//!
//! This crate takes one traffic-camera image, counts the vehicles a
//! detector backend finds in it, classifies the traffic density into a
//! tier, and derives a recommended green-light duration for the signal.
//!
//! # Architecture
//!
//! - `detect`: detector backends (stub, optional tract-onnx) behind the
//!   `DetectorBackend` trait
//! - `ingest`: JPEG/PNG decoding into RGB8 frames
//! - `store`: single-slot "latest upload" image store
//! - `api`: dashboard + upload HTTP surface
//! - Core types: vehicle taxonomy, density bands, `TrafficAnalyzer`
//!
//! The analysis core is pure: tallying and density classification are
//! total functions that cannot fail. The only fallible steps are image
//! decoding and the inference call, and those fail the whole request:
//! there is no partial result, no retry, no degraded fallback.

use anyhow::anyhow;
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub mod api;
pub mod config;
pub mod detect;
pub mod ingest;
pub mod store;

pub use detect::{BackendRegistry, Detection, DetectorBackend, StubBackend};
#[cfg(feature = "backend-tract")]
pub use detect::TractBackend;
pub use ingest::DecodedImage;
pub use store::{ImageKind, UploadSlot};

// -------------------- Vehicle Taxonomy --------------------

/// Vehicle classes counted by the analyzer.
///
/// The detector speaks COCO class ids (0..=79); only four of those ids
/// denote vehicles. Every other id is discarded during tallying.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VehicleClass {
    Car,
    Motorcycle,
    Bus,
    Truck,
}

impl VehicleClass {
    pub const ALL: [VehicleClass; 4] = [
        VehicleClass::Car,
        VehicleClass::Motorcycle,
        VehicleClass::Bus,
        VehicleClass::Truck,
    ];

    /// Fixed COCO id mapping: 2=car, 3=motorcycle, 5=bus, 7=truck.
    /// Ids outside the set are not vehicles, not errors.
    pub fn from_coco_id(class_id: u32) -> Option<Self> {
        match class_id {
            2 => Some(VehicleClass::Car),
            3 => Some(VehicleClass::Motorcycle),
            5 => Some(VehicleClass::Bus),
            7 => Some(VehicleClass::Truck),
            _ => None,
        }
    }

    pub fn coco_id(self) -> u32 {
        match self {
            VehicleClass::Car => 2,
            VehicleClass::Motorcycle => 3,
            VehicleClass::Bus => 5,
            VehicleClass::Truck => 7,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            VehicleClass::Car => "car",
            VehicleClass::Motorcycle => "motorcycle",
            VehicleClass::Bus => "bus",
            VehicleClass::Truck => "truck",
        }
    }
}

/// Per-class vehicle counts. All four classes are always present;
/// missing classes count zero, never a partial mapping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VehicleCounts {
    pub car: u32,
    pub motorcycle: u32,
    pub bus: u32,
    pub truck: u32,
}

impl VehicleCounts {
    pub fn increment(&mut self, class: VehicleClass) {
        match class {
            VehicleClass::Car => self.car += 1,
            VehicleClass::Motorcycle => self.motorcycle += 1,
            VehicleClass::Bus => self.bus += 1,
            VehicleClass::Truck => self.truck += 1,
        }
    }

    pub fn get(&self, class: VehicleClass) -> u32 {
        match class {
            VehicleClass::Car => self.car,
            VehicleClass::Motorcycle => self.motorcycle,
            VehicleClass::Bus => self.bus,
            VehicleClass::Truck => self.truck,
        }
    }

    pub fn total(&self) -> u32 {
        self.car + self.motorcycle + self.bus + self.truck
    }
}

/// Count vehicles in a detection list.
///
/// Pure commutative accumulation: input order never affects the result,
/// and non-vehicle detections are dropped without logging.
pub fn tally_vehicles(detections: &[Detection]) -> VehicleCounts {
    let mut counts = VehicleCounts::default();
    for detection in detections {
        if let Some(class) = VehicleClass::from_coco_id(detection.class_id) {
            counts.increment(class);
        }
    }
    counts
}

// -------------------- Density Bands --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum DensityTier {
    Low,
    Medium,
    High,
}

/// One row of the density table.
#[derive(Clone, Copy, Debug)]
pub struct DensityBand {
    /// Inclusive upper bound on total vehicles; `None` is unbounded.
    pub upper: Option<u32>,
    pub tier: DensityTier,
    pub color: &'static str,
    pub green_duration_s: u32,
}

/// Ordered, non-overlapping, exhaustive threshold bands. The last row
/// has no upper bound, so every non-negative total lands in exactly one
/// band.
pub static DENSITY_BANDS: [DensityBand; 3] = [
    DensityBand {
        upper: Some(5),
        tier: DensityTier::Low,
        color: "#4CAF50",
        green_duration_s: 30,
    },
    DensityBand {
        upper: Some(15),
        tier: DensityTier::Medium,
        color: "#FF9800",
        green_duration_s: 45,
    },
    DensityBand {
        upper: None,
        tier: DensityTier::High,
        color: "#F44336",
        green_duration_s: 60,
    },
];

/// Map a vehicle total to its density band. Total function: every input
/// selects exactly one row.
pub fn classify_density(total_vehicles: u32) -> &'static DensityBand {
    for band in &DENSITY_BANDS {
        match band.upper {
            Some(upper) if total_vehicles > upper => continue,
            _ => return band,
        }
    }
    // The final band is unbounded, so the loop above always returns.
    &DENSITY_BANDS[DENSITY_BANDS.len() - 1]
}

// -------------------- Analysis Result --------------------

/// Immutable per-request analysis record. Constructed fresh for every
/// upload; nothing is cached across requests.
#[derive(Clone, Debug, Serialize)]
pub struct AnalysisResult {
    pub total_vehicles: u32,
    pub vehicle_counts: VehicleCounts,
    pub density: DensityTier,
    pub density_color: &'static str,
    pub green_duration: u32,
}

impl AnalysisResult {
    pub fn from_counts(vehicle_counts: VehicleCounts) -> Self {
        let total_vehicles = vehicle_counts.total();
        let band = classify_density(total_vehicles);
        Self {
            total_vehicles,
            vehicle_counts,
            density: band.tier,
            density_color: band.color,
            green_duration: band.green_duration_s,
        }
    }
}

// -------------------- Analysis Errors --------------------

/// The two ways an analysis can fail. Both are terminal for the request:
/// the orchestrator never retries and never reports partial counts.
#[derive(Debug)]
pub enum AnalysisError {
    /// The provided image could not be read or decoded.
    InvalidInput(anyhow::Error),
    /// The detector raised during inference.
    DetectionFailure(anyhow::Error),
}

impl std::fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnalysisError::InvalidInput(cause) => write!(f, "invalid input image: {}", cause),
            AnalysisError::DetectionFailure(cause) => write!(f, "detection failed: {}", cause),
        }
    }
}

impl std::error::Error for AnalysisError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AnalysisError::InvalidInput(cause) | AnalysisError::DetectionFailure(cause) => {
                let cause: &(dyn std::error::Error + 'static) = &**cause;
                Some(cause)
            }
        }
    }
}

// -------------------- Analyzer --------------------

/// Analysis orchestrator.
///
/// Holds the process-wide detector handle, initialized once at startup
/// and injected here so tests can substitute a stub backend. The
/// backend sits behind a `Mutex` because `detect` takes `&mut self`;
/// one analysis runs start-to-finish on the calling thread.
pub struct TrafficAnalyzer {
    backend: Arc<Mutex<dyn DetectorBackend>>,
}

impl TrafficAnalyzer {
    pub fn new(backend: Arc<Mutex<dyn DetectorBackend>>) -> Self {
        Self { backend }
    }

    /// Analyze an encoded JPEG/PNG payload.
    pub fn analyze_bytes(&self, bytes: &[u8]) -> Result<AnalysisResult, AnalysisError> {
        let image = ingest::decode_image(bytes).map_err(AnalysisError::InvalidInput)?;
        self.analyze_decoded(&image)
    }

    /// Analyze an image file on disk.
    pub fn analyze_path(&self, path: &Path) -> Result<AnalysisResult, AnalysisError> {
        let image = ingest::load_image(path).map_err(AnalysisError::InvalidInput)?;
        self.analyze_decoded(&image)
    }

    fn analyze_decoded(&self, image: &DecodedImage) -> Result<AnalysisResult, AnalysisError> {
        let detections = {
            let mut backend = self.backend.lock().map_err(|_| {
                AnalysisError::DetectionFailure(anyhow!("detector backend lock poisoned"))
            })?;
            backend
                .detect(image.pixels(), image.width, image.height)
                .map_err(AnalysisError::DetectionFailure)?
        };
        Ok(AnalysisResult::from_counts(tally_vehicles(&detections)))
    }
}

// -------------------- Tests --------------------
