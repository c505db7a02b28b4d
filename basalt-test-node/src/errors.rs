use basalt_wire::frame::frame_errors::FrameHeaderParseError;
use basalt_wire::frame::request::RequestDeserializationError;
use thiserror::Error;

/// An error that terminated a mock node or one of its connection workers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MockNodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to read a request frame: {0}")]
    FrameRead(#[from] FrameHeaderParseError),
    #[error("Failed to deserialize a request body: {0}")]
    RequestDeserialization(#[from] RequestDeserializationError),
}
