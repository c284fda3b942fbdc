//! Foreign bindings for mobile hosts.
//!
//! Only the pure codec and parser surface is exported. The host owns the
//! BLE stack, so it frames commands and decodes listings here and moves the
//! bytes itself.

use crate::answers::{self, FileEntry};
use crate::codec;
use crate::error::{AnswerError, EngineError};

#[derive(Debug, thiserror::Error, uniffi::Error)]
#[uniffi(flat_error)]
pub enum FfiError {
    #[error("{0}")]
    InvalidCommand(String),
    #[error("{0}")]
    MalformedAnswer(String),
}

impl From<EngineError> for FfiError {
    fn from(err: EngineError) -> Self {
        FfiError::InvalidCommand(err.to_string())
    }
}

impl From<AnswerError> for FfiError {
    fn from(err: AnswerError) -> Self {
        FfiError::MalformedAnswer(err.to_string())
    }
}

#[uniffi::export]
pub fn crc16(data: Vec<u8>) -> u16 {
    codec::crc16(&data)
}

#[uniffi::export]
pub fn crc32(data: Vec<u8>) -> u32 {
    codec::crc32(&data)
}

/// Frame `command` for the write characteristic, `\r` included.
#[uniffi::export]
pub fn encode_command(command: String, argument: Option<String>) -> Result<Vec<u8>, FfiError> {
    Ok(codec::encode(&command, argument.as_deref())?.bytes)
}

#[uniffi::export]
pub fn parse_directory_listing(answer: Vec<u8>) -> Result<Vec<FileEntry>, FfiError> {
    Ok(answers::parse_directory_listing(&answer)?)
}
