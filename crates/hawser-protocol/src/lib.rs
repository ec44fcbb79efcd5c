//! hawser-protocol: Wire protocol for the Hawser agent control-plane link
//!
//! This crate defines the length-prefixed JSON protocol spoken between a
//! host agent and the control plane: the frame envelope, the message
//! enum, and the tokio codec that frames them over a byte stream.

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{FrameCodec, LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE};
pub use error::ProtocolError;
pub use message::{
    base64_bytes, terminal_channel, Envelope, ErrorCode, HeartbeatMetrics, Message,
};
