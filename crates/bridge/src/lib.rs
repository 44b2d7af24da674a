pub mod client;
pub mod codec;
pub mod errors;
pub mod protocol;

pub use client::InferenceClient;
pub use codec::{
    encode_capture_frame, encode_inference_request, read_capture_frame, read_capture_length,
    read_frame_body, read_inference_request, write_capture_frame, write_inference_request,
};
pub use errors::{BridgeError, FrameError};
pub use protocol::Mode;
