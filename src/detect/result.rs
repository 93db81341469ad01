use serde::Serialize;

/// One observed object from a detector.
///
/// Box coordinates are normalized 0..1 relative to the source frame
/// (x, y is the top-left corner). The analysis core reads only
/// `class_id`; confidence and box are carried for callers that render
/// or debug detections.
#[derive(Clone, Debug, Serialize)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub confidence: f32,
    /// COCO class id (0..=79).
    pub class_id: u32,
}
