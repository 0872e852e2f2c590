//! Control channel messages and their line codec
//!
//! Each message is JSON, base64-encoded and terminated by `\n`. Empty lines
//! are skipped when decoding, so peers may also emit a leading separator.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// Longest encoded line accepted from a peer
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Control channel message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Free-form payload; the first one an agent sends names its tunnel
    Data(String),
    /// Liveness signal from the agent
    HeartBeat,
    /// The agent is going away on purpose
    Quit,
}

/// Control channel errors
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Control line exceeds the maximum length")]
    LineTooLong,

    #[error("Invalid base64 in control line: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Invalid control message: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<LinesCodecError> for ControlError {
    fn from(err: LinesCodecError) -> Self {
        match err {
            LinesCodecError::MaxLineLengthExceeded => ControlError::LineTooLong,
            LinesCodecError::Io(e) => ControlError::Io(e),
        }
    }
}

impl ControlMessage {
    /// Encode as one base64 line without the trailing newline
    pub fn to_line(&self) -> Result<String, ControlError> {
        let json = serde_json::to_vec(self)?;
        Ok(BASE64.encode(json))
    }

    pub fn from_line(line: &str) -> Result<Self, ControlError> {
        let json = BASE64.decode(line.trim())?;
        Ok(serde_json::from_slice(&json)?)
    }
}

/// `tokio_util` codec for [`ControlMessage`] streams
#[derive(Debug)]
pub struct ControlCodec {
    lines: LinesCodec,
}

impl ControlCodec {
    pub fn new() -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        }
    }
}

impl Default for ControlCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ControlCodec {
    type Item = ControlMessage;
    type Error = ControlError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(line) = self.lines.decode(src)? {
            if !line.trim().is_empty() {
                return ControlMessage::from_line(&line).map(Some);
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(line) = self.lines.decode_eof(src)? {
            if !line.trim().is_empty() {
                return ControlMessage::from_line(&line).map(Some);
            }
        }
        Ok(None)
    }
}

impl Encoder<ControlMessage> for ControlCodec {
    type Error = ControlError;

    fn encode(&mut self, item: ControlMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = item.to_line()?;
        self.lines.encode(line, dst)?;
        Ok(())
    }
}
