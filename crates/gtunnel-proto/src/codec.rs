//! Codec for encoding/decoding protocol frames

use crate::messages::{StreamHeader, TunnelControlMessage};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Length-prefixed bincode codec
///
/// Format: `[length: u32 big-endian][payload: bincode serialized T]`
pub struct FrameCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

/// Codec for the control stream
pub type ControlCodec = FrameCodec<TunnelControlMessage>;

/// Codec for the header that opens a relay-bound stream
pub type HeaderCodec = FrameCodec<StreamHeader>;

impl<T> FrameCodec<T> {
    /// Length prefix size
    pub const LENGTH_SIZE: usize = 4;

    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for FrameCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for FrameCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameCodec").finish()
    }
}

impl<T: Serialize> FrameCodec<T> {
    /// Encode a message to bytes
    pub fn encode(msg: &T) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        Self::encode_into(msg, &mut buf)?;
        Ok(buf.freeze())
    }

    fn encode_into(msg: &T, buf: &mut BytesMut) -> Result<(), CodecError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() > crate::MAX_FRAME_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        buf.reserve(Self::LENGTH_SIZE + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);
        Ok(())
    }
}

impl<T: DeserializeOwned> FrameCodec<T> {
    /// Decode a message from bytes
    ///
    /// Returns Ok(Some(message)) if a complete message was decoded,
    /// Ok(None) if more data is needed,
    /// Err on error
    pub fn decode(buf: &mut BytesMut) -> Result<Option<T>, CodecError> {
        if buf.len() < Self::LENGTH_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..Self::LENGTH_SIZE]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > crate::MAX_FRAME_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if buf.len() < Self::LENGTH_SIZE + length {
            buf.reserve(Self::LENGTH_SIZE + length - buf.len());
            return Ok(None);
        }

        buf.advance(Self::LENGTH_SIZE);
        let msg_bytes = buf.split_to(length);

        Ok(Some(bincode::deserialize(&msg_bytes)?))
    }

    /// Decode a payload whose length prefix has already been consumed
    pub fn decode_payload(payload: &[u8]) -> Result<T, CodecError> {
        Ok(bincode::deserialize(payload)?)
    }
}

impl<'a, T: Serialize> Encoder<&'a T> for FrameCodec<T> {
    type Error = CodecError;

    fn encode(&mut self, item: &'a T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Self::encode_into(item, dst)
    }
}

impl<T: DeserializeOwned> Decoder for FrameCodec<T> {
    type Item = T;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        FrameCodec::<T>::decode(src)
    }
}
