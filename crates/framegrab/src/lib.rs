pub mod config;
pub mod demux;
pub mod error;
pub mod format;
pub mod frame;
pub mod metadata;
#[cfg(test)]
mod mock;
pub mod normalize;
pub mod process;
pub mod session;

pub use config::{GrabConfig, ToolConfig};
pub use error::{CaptureError, ConversionError, FormatError, MetadataError, ProcessError};
pub use format::{CaptureConfig, PixelFormat, Resolution, VideoSource};
pub use frame::Frame;
pub use metadata::StreamMetadata;
pub use normalize::normalize;
pub use session::{FrameSequence, SessionHandle, SessionRegistry, SessionState};
