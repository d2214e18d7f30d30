//! gTunnel Protocol Definitions
//!
//! This crate defines the control messages exchanged between the two endpoints
//! of a tunnel, the header that opens every relay-bound TCP stream, and the
//! length-prefixed codec used to put them on the wire.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, ControlCodec, FrameCodec, HeaderCodec};
pub use messages::*;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
