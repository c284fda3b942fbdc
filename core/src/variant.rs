//! Hardware families and what sets them apart on the wire.
//!
//! Both families speak the same command set. They differ in GATT layout,
//! in how answers are framed (the RN4020 wraps every answer in
//! `"\n\r" ... "\r\n"`), in a few family-only tags and in the file transfer
//! protocol. The family is picked once at connect time and never changes
//! for the session.

use std::fmt;

use uuid::Uuid;

use crate::ble::GattProfile;
use crate::config::DetectionSettings;
use crate::rules::{RuleTable, CC26X2_RULES, RN4020_RULES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardwareFamily {
    Cc26x2,
    Rn4020,
    /// In-memory logger used for testing.
    Dummy,
}

impl fmt::Display for HardwareFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardwareFamily::Cc26x2 => write!(f, "CC26x2"),
            HardwareFamily::Rn4020 => write!(f, "RN4020"),
            HardwareFamily::Dummy => write!(f, "dummy"),
        }
    }
}

/// How files come off the logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileProtocol {
    /// `DWG` to stage, then indexed 2048-byte `DWL` chunks.
    Chunked,
    /// `GET` to stage, then a receiver-driven XMODEM session.
    XModem,
}

/// Everything the engines need to know about a family.
pub trait HardwareVariant: Send + Sync + fmt::Debug {
    fn family(&self) -> HardwareFamily;

    fn gatt_profile(&self) -> GattProfile;

    fn rules(&self) -> &'static RuleTable;

    /// Strip the family's answer framing. `None` while the framing itself
    /// is still incomplete.
    fn trim<'a>(&self, raw: &'a [u8]) -> Option<&'a [u8]>;

    /// Strip whatever framing is present, for answers that never finished.
    fn strip_partial<'a>(&self, raw: &'a [u8]) -> &'a [u8] {
        self.trim(raw).unwrap_or(raw)
    }

    fn file_protocol(&self) -> FileProtocol;
}

#[derive(Debug)]
pub struct Cc26x2;

#[derive(Debug)]
pub struct Rn4020;

#[derive(Debug)]
pub struct Dummy;

pub const CC26X2_PROFILE: GattProfile = GattProfile {
    service: Uuid::from_u128(0xf0001130_0451_4000_b000_000000000000),
    write_characteristic: Uuid::from_u128(0xf0001132_0451_4000_b000_000000000000),
    notify_characteristic: Uuid::from_u128(0xf0001131_0451_4000_b000_000000000000),
};

pub const RN4020_PROFILE: GattProfile = GattProfile {
    service: Uuid::from_u128(0x00035b03_58e6_07dd_021a_08123a000300),
    write_characteristic: Uuid::from_u128(0x00035b03_58e6_07dd_021a_08123a000301),
    notify_characteristic: Uuid::from_u128(0x00035b03_58e6_07dd_021a_08123a000301),
};

pub const RN4020_HEAD: &[u8] = b"\n\r";
pub const RN4020_TAIL: &[u8] = b"\r\n";

/// Line break the CC26x2 sends after the listing's end marker. It can arrive
/// in a notification of its own, after the listing already completed.
const CC26X2_LISTING_TAIL: &[u8] = b"\n\r";

fn strip_listing_tail(raw: &[u8]) -> &[u8] {
    raw.strip_prefix(CC26X2_LISTING_TAIL).unwrap_or(raw)
}

impl HardwareVariant for Cc26x2 {
    fn family(&self) -> HardwareFamily {
        HardwareFamily::Cc26x2
    }

    fn gatt_profile(&self) -> GattProfile {
        CC26X2_PROFILE
    }

    fn rules(&self) -> &'static RuleTable {
        &CC26X2_RULES
    }

    fn trim<'a>(&self, raw: &'a [u8]) -> Option<&'a [u8]> {
        Some(strip_listing_tail(raw))
    }

    fn file_protocol(&self) -> FileProtocol {
        FileProtocol::Chunked
    }
}

impl HardwareVariant for Rn4020 {
    fn family(&self) -> HardwareFamily {
        HardwareFamily::Rn4020
    }

    fn gatt_profile(&self) -> GattProfile {
        RN4020_PROFILE
    }

    fn rules(&self) -> &'static RuleTable {
        &RN4020_RULES
    }

    fn trim<'a>(&self, raw: &'a [u8]) -> Option<&'a [u8]> {
        let body = raw.strip_prefix(RN4020_HEAD).unwrap_or(raw);
        body.strip_suffix(RN4020_TAIL)
    }

    fn strip_partial<'a>(&self, raw: &'a [u8]) -> &'a [u8] {
        let body = raw.strip_prefix(RN4020_HEAD).unwrap_or(raw);
        body.strip_suffix(RN4020_TAIL).unwrap_or(body)
    }

    fn file_protocol(&self) -> FileProtocol {
        FileProtocol::XModem
    }
}

impl HardwareVariant for Dummy {
    fn family(&self) -> HardwareFamily {
        HardwareFamily::Dummy
    }

    fn gatt_profile(&self) -> GattProfile {
        GattProfile {
            service: Uuid::nil(),
            write_characteristic: Uuid::nil(),
            notify_characteristic: Uuid::nil(),
        }
    }

    fn rules(&self) -> &'static RuleTable {
        &CC26X2_RULES
    }

    fn trim<'a>(&self, raw: &'a [u8]) -> Option<&'a [u8]> {
        Some(strip_listing_tail(raw))
    }

    fn file_protocol(&self) -> FileProtocol {
        FileProtocol::Chunked
    }
}

pub fn variant_for(family: HardwareFamily) -> &'static dyn HardwareVariant {
    match family {
        HardwareFamily::Cc26x2 => &Cc26x2,
        HardwareFamily::Rn4020 => &Rn4020,
        HardwareFamily::Dummy => &Dummy,
    }
}

fn starts_with_any(value: &str, prefixes: &[String]) -> bool {
    let value = value.to_ascii_lowercase();
    prefixes
        .iter()
        .any(|p| !p.is_empty() && value.starts_with(&p.to_ascii_lowercase()))
}

/// Pick the family from the device address, falling back to its name.
pub fn detect_family(
    address: &str,
    name: &str,
    detection: &DetectionSettings,
) -> Option<HardwareFamily> {
    if starts_with_any(address, &detection.dummy_addresses) {
        Some(HardwareFamily::Dummy)
    } else if starts_with_any(address, &detection.rn4020_addresses) {
        Some(HardwareFamily::Rn4020)
    } else if starts_with_any(address, &detection.cc26x2_addresses) {
        Some(HardwareFamily::Cc26x2)
    } else if starts_with_any(name, &detection.rn4020_names) {
        Some(HardwareFamily::Rn4020)
    } else if starts_with_any(name, &detection.cc26x2_names) {
        Some(HardwareFamily::Cc26x2)
    } else {
        None
    }
}
