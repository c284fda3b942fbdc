//! Typed decoding of command answers.
//!
//! Most answers share one shape, `"{tag} {hex2 n}{value}"`, where `n` is the
//! byte length of `value`. Plain acknowledgements are the same shape with an
//! empty value (`"RUN 00"`). The directory listing is the exception: one
//! `name<TAB..>size` line per file, closed by `0x04`.

use chrono::NaiveDateTime;
use nom::{
    bytes::complete::{take_till1, take_while1, take_while_m_n},
    character::complete::{char, digit1},
    combinator::{all_consuming, map_res},
    IResult, Parser,
};

use crate::codec::TAG_LEN;
use crate::error::AnswerError;
use crate::rules::{tags, END_OF_LIST};

/// Logger clock format, both in `GTM` answers and `STM` arguments.
pub const TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// One file on the logger.
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
}

/// Logging state reported by `STS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoggerStatus {
    Running,
    Stopped,
    /// Armed, waiting for a delayed start time.
    Delayed,
    Other(String),
}

impl LoggerStatus {
    fn from_code(code: &str) -> Self {
        match code {
            "00" => LoggerStatus::Running,
            "01" => LoggerStatus::Stopped,
            "02" | "03" => LoggerStatus::Delayed,
            other => LoggerStatus::Other(other.to_string()),
        }
    }
}

fn malformed(tag: &str, message: impl Into<String>) -> AnswerError {
    AnswerError::Malformed {
        tag: tag.to_string(),
        message: message.into(),
    }
}

fn as_text<'a>(tag: &str, answer: &'a [u8]) -> Result<&'a str, AnswerError> {
    std::str::from_utf8(answer).map_err(|e| malformed(tag, e.to_string()))
}

fn reply_header(input: &str) -> IResult<&str, (&str, usize)> {
    let (input, (tag, _, len)) = (
        take_while_m_n(TAG_LEN, TAG_LEN, |c: char| c.is_ascii_alphanumeric()),
        char(' '),
        map_res(
            take_while_m_n(2, 2, |c: char| c.is_ascii_hexdigit()),
            |hex: &str| usize::from_str_radix(hex, 16),
        ),
    )
        .parse(input)?;
    Ok((input, (tag, len)))
}

/// Check the tag and declared length of a generic answer and return its
/// value.
pub fn parse_reply<'a>(tag: &str, answer: &'a [u8]) -> Result<&'a str, AnswerError> {
    let text = as_text(tag, answer)?;
    let (value, (found, declared)) =
        reply_header(text).map_err(|e| malformed(tag, format!("{e} in {text:?}")))?;
    if found != tag {
        return Err(malformed(tag, format!("answer is for {found}")));
    }
    if value.len() != declared {
        return Err(AnswerError::LengthMismatch {
            tag: tag.to_string(),
            declared,
            actual: value.len(),
        });
    }
    Ok(value)
}

pub fn parse_status(answer: &[u8]) -> Result<LoggerStatus, AnswerError> {
    let code = parse_reply(tags::STATUS, answer)?;
    if code.is_empty() {
        return Err(malformed(tags::STATUS, "empty status code"));
    }
    Ok(LoggerStatus::from_code(code))
}

pub fn parse_firmware_version(answer: &[u8]) -> Result<String, AnswerError> {
    Ok(parse_reply(tags::FIRMWARE_VERSION, answer)?.to_string())
}

/// `BAT` carries the millivolts as the hex of their little-endian bytes:
/// `"E80C"` is 0x0CE8, 3304 mV.
pub fn parse_battery_mv(answer: &[u8]) -> Result<u16, AnswerError> {
    let value = parse_reply(tags::BATTERY, answer)?;
    let raw = u16::from_str_radix(value, 16)
        .ok()
        .filter(|_| value.len() == 4)
        .ok_or_else(|| malformed(tags::BATTERY, format!("{value:?} is not 4 hex digits")))?;
    Ok(raw.swap_bytes())
}

pub fn parse_time(answer: &[u8]) -> Result<NaiveDateTime, AnswerError> {
    let value = parse_reply(tags::GET_TIME, answer)?;
    NaiveDateTime::parse_from_str(value, TIME_FORMAT)
        .map_err(|e| malformed(tags::GET_TIME, format!("{value:?}: {e}")))
}

/// Argument for `STM`.
pub fn format_time(time: &NaiveDateTime) -> String {
    time.format(TIME_FORMAT).to_string()
}

/// `SIZ` answers the file size in decimal.
pub fn parse_file_size(answer: &[u8]) -> Result<u64, AnswerError> {
    let value = parse_reply(tags::FILE_SIZE, answer)?;
    value
        .parse()
        .map_err(|_| malformed(tags::FILE_SIZE, format!("{value:?} is not a size")))
}

/// `CRC` answers the zlib CRC32 of the file as 8 hex digits.
pub fn parse_file_crc(answer: &[u8]) -> Result<u32, AnswerError> {
    let value = parse_reply(tags::FILE_CRC, answer)?;
    if value.len() != 8 {
        return Err(malformed(tags::FILE_CRC, format!("{value:?} is not 8 hex digits")));
    }
    u32::from_str_radix(value, 16)
        .map_err(|_| malformed(tags::FILE_CRC, format!("{value:?} is not hex")))
}

fn listing_line(input: &str) -> IResult<&str, FileEntry> {
    let (input, (name, _, size)) = (
        take_till1(|c: char| c == '\t'),
        take_while1(|c: char| c == '\t'),
        map_res(digit1, str::parse::<u64>),
    )
        .parse(input)?;
    Ok((
        input,
        FileEntry {
            name: name.to_string(),
            size,
        },
    ))
}

/// Decode a `DIR` listing. The `.` and `..` entries are dropped.
pub fn parse_directory_listing(answer: &[u8]) -> Result<Vec<FileEntry>, AnswerError> {
    let end = answer
        .iter()
        .rposition(|b| *b == END_OF_LIST)
        .ok_or_else(|| malformed(tags::DIR, "missing end-of-list marker"))?;
    let body = as_text(tags::DIR, &answer[..end])?;

    let mut entries = Vec::new();
    for line in body.split(['\r', '\n']).filter(|l| !l.is_empty()) {
        let (_, entry) = all_consuming(listing_line)
            .parse(line)
            .map_err(|e| malformed(tags::DIR, format!("{e} in line {line:?}")))?;
        if entry.name == "." || entry.name == ".." {
            continue;
        }
        entries.push(entry);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_parse_reply() {
        assert_eq!(parse_reply("GFV", b"GFV 063.1.07").unwrap(), "3.1.07");
        assert_eq!(parse_reply("RUN", b"RUN 00").unwrap(), "");
        assert_eq!(
            parse_reply("GFV", b"GFV 073.1.07"),
            Err(AnswerError::LengthMismatch {
                tag: "GFV".into(),
                declared: 7,
                actual: 6
            })
        );
        assert!(matches!(
            parse_reply("STS", b"GFV 00"),
            Err(AnswerError::Malformed { .. })
        ));
        assert!(parse_reply("STS", b"STS").is_err());
        assert!(parse_reply("STS", b"STS zz").is_err());
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status(b"STS 0200").unwrap(), LoggerStatus::Running);
        assert_eq!(parse_status(b"STS 0201").unwrap(), LoggerStatus::Stopped);
        assert_eq!(parse_status(b"STS 0203").unwrap(), LoggerStatus::Delayed);
        assert_eq!(
            parse_status(b"STS 0299").unwrap(),
            LoggerStatus::Other("99".into())
        );
        assert!(parse_status(b"STS 00").is_err());
    }

    #[test]
    fn test_parse_battery_is_byte_swapped() {
        assert_eq!(parse_battery_mv(b"BAT 04E80C").unwrap(), 3304);
        assert_eq!(parse_battery_mv(b"BAT 04e80c").unwrap(), 3304);
        assert!(parse_battery_mv(b"BAT 02E8").is_err());
        assert!(parse_battery_mv(b"BAT 04XXXX").is_err());
    }

    #[test]
    fn test_parse_time() {
        let time = parse_time(b"GTM 132024/03/05 10:20:30").unwrap();
        let expected = NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_opt(10, 20, 30)
            .unwrap();
        assert_eq!(time, expected);
        assert_eq!(format_time(&expected), "2024/03/05 10:20:30");
        assert!(parse_time(b"GTM 132024/13/05 10:20:30").is_err());
    }

    #[test]
    fn test_parse_size_and_crc() {
        assert_eq!(parse_file_size(b"SIZ 045000").unwrap(), 5000);
        assert!(parse_file_size(b"SIZ 02ab").is_err());
        assert_eq!(parse_file_crc(b"CRC 08cbf43926").unwrap(), 0xCBF4_3926);
        assert!(parse_file_crc(b"CRC 04cbf4").is_err());
    }

    #[test]
    fn test_parse_directory_listing() {
        let listing = b".\t\t\t0\n\r..\t\t\t0\n\r2024-03-05_data.lid\t\t\t5000\n\rnotes.lix\t\t\t300\n\r\x04\n\r";
        let entries = parse_directory_listing(listing).unwrap();
        assert_eq!(
            entries,
            vec![
                FileEntry {
                    name: "2024-03-05_data.lid".into(),
                    size: 5000
                },
                FileEntry {
                    name: "notes.lix".into(),
                    size: 300
                },
            ]
        );
    }

    #[test]
    fn test_parse_empty_listing() {
        assert!(parse_directory_listing(b"\x04\n\r").unwrap().is_empty());
        assert!(parse_directory_listing(b"\x04").unwrap().is_empty());
    }

    #[test]
    fn test_parse_bad_listing() {
        assert!(parse_directory_listing(b"a.lid\t\t\t10\n\r").is_err());
        let err = parse_directory_listing(b"a.lid 10\n\r\x04").unwrap_err();
        assert_eq!(err.tag(), "DIR");
    }
}
