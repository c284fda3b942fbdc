//! Wire framing for logger commands and the checksums used on the link.
//!
//! Two framing modes exist and are picked from the shape of the command:
//!
//! - *Proprietary*: `"{tag} {hex2(len(argument))}{argument}\r"`. Without an
//!   argument the length field is empty, leaving `"{tag} \r"`.
//! - *Transparent*: the caller already built the whole frame (it contains a
//!   space), so it is sent verbatim followed by `\r`.

use crc::{Crc, CRC_16_XMODEM};

use crate::error::EngineError;

/// Two hex digits carry the argument length.
pub const MAX_ARGUMENT_LEN: usize = 0xff;

/// Length of every command/answer tag.
pub const TAG_LEN: usize = 3;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    Proprietary,
    Transparent,
}

impl FrameMode {
    pub fn detect(command: &str) -> Self {
        if command.contains(' ') {
            FrameMode::Transparent
        } else {
            FrameMode::Proprietary
        }
    }
}

/// An encoded command ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Tag the answer will be matched against.
    pub tag: String,
    pub mode: FrameMode,
    pub bytes: Vec<u8>,
}

/// Encode a command and its optional argument.
pub fn encode(command: &str, argument: Option<&str>) -> Result<Frame, EngineError> {
    let mode = FrameMode::detect(command);
    let argument = argument.filter(|a| !a.is_empty());

    let bytes = match mode {
        FrameMode::Transparent => {
            if argument.is_some() {
                return Err(EngineError::InvalidCommand(format!(
                    "pre-built frame {command:?} cannot take an argument"
                )));
            }
            let mut bytes = command.as_bytes().to_vec();
            bytes.push(b'\r');
            bytes
        }
        FrameMode::Proprietary => {
            validate_tag(command)?;
            match argument {
                None => format!("{command} \r").into_bytes(),
                Some(arg) => {
                    if arg.len() > MAX_ARGUMENT_LEN {
                        return Err(EngineError::InvalidCommand(format!(
                            "{command} argument is {} bytes, limit is {MAX_ARGUMENT_LEN}",
                            arg.len()
                        )));
                    }
                    format!("{command} {:02x}{arg}\r", arg.len()).into_bytes()
                }
            }
        }
    };

    let tag = decode_tag(&bytes)
        .ok_or_else(|| EngineError::InvalidCommand(format!("no tag in {command:?}")))?
        .to_string();

    Ok(Frame { tag, mode, bytes })
}

fn validate_tag(tag: &str) -> Result<(), EngineError> {
    if tag.len() == TAG_LEN && tag.bytes().all(|b| b.is_ascii_alphanumeric()) {
        Ok(())
    } else {
        Err(EngineError::InvalidCommand(format!(
            "tag must be {TAG_LEN} ASCII letters or digits, got {tag:?}"
        )))
    }
}

/// Read the tag back out of an encoded frame.
pub fn decode_tag(frame: &[u8]) -> Option<&str> {
    let head = frame.get(..TAG_LEN)?;
    if !head.iter().all(u8::is_ascii_alphanumeric) {
        return None;
    }
    match frame.get(TAG_LEN) {
        None | Some(b' ') | Some(b'\r') => std::str::from_utf8(head).ok(),
        Some(_) => None,
    }
}

/// CRC-16/XMODEM: polynomial 0x1021, initial value 0, no reflection.
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Compare a payload against the big-endian CRC trailer of an XMODEM frame.
pub fn verify_crc16(payload: &[u8], trailer: [u8; 2]) -> bool {
    crc16(payload) == u16::from_be_bytes(trailer)
}

/// zlib CRC32 of a whole file, matched against the logger's `CRC` answer.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}
