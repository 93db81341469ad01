use anyhow::Result;

use crate::detect::result::Detection;

/// Detector backend trait.
///
/// A backend consumes one RGB8 frame per call and returns the finite
/// list of objects it observed, each carrying a COCO class id. The
/// pixel slice is read-only and ephemeral; implementations must not
/// retain it beyond the call.
///
/// Backends do not filter for vehicles; taxonomy decisions belong to
/// the tally stage, which discards non-vehicle classes.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on an RGB8 frame.
    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
