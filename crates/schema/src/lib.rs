//! Domain records shared by the bridge and the inspector service.
//!
//! These are the values that leave the bridge: the final outcome of one inspected
//! item, its per-camera detections, and the JSON reply sent back to capture clients.

mod outcome;
mod reply;
pub mod timestamp;

pub use outcome::{Camera, DetectionRecord, InspectionOutcome, InspectionResult, ParseError};
pub use reply::{ClientReply, ReplyStatus};
