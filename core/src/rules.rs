//! Declarative answer-completion rules and per-tag timeout budgets.
//!
//! Every answer shape is fixed per tag and per hardware family, so deciding
//! whether an accumulated buffer is a finished answer is a table lookup
//! followed by one generic check. Buffers reach these rules already trimmed
//! of any family-specific wrapping.

use std::collections::HashMap;
use std::time::Duration;

use crate::codec::TAG_LEN;

use tags::*;

/// Command tags understood by the loggers.
pub mod tags {
    pub const STATUS: &str = "STS";
    pub const FIRMWARE_VERSION: &str = "GFV";
    pub const GET_TIME: &str = "GTM";
    pub const SET_TIME: &str = "STM";
    pub const DIR: &str = "DIR";
    pub const DELETE: &str = "DEL";
    pub const RUN: &str = "RUN";
    pub const RUN_WITH_STRING: &str = "RWS";
    pub const STOP: &str = "STP";
    pub const STOP_WITH_STRING: &str = "SWS";
    pub const FORMAT: &str = "FRM";
    pub const FILE_SIZE: &str = "SIZ";
    pub const FILE_CRC: &str = "CRC";
    pub const BATTERY: &str = "BAT";
    pub const LED: &str = "LED";
    pub const READ_LOGGER_INFO: &str = "RLI";
    pub const WRITE_LOGGER_INFO: &str = "WLI";
    pub const READ_HOST_STORAGE: &str = "RHS";
    pub const WRITE_HOST_STORAGE: &str = "WHS";
    pub const UP_TIME: &str = "UTM";
    pub const RESET: &str = "RST";
    pub const DOWNLOAD_STAGE: &str = "DWG";
    pub const DOWNLOAD_CHUNK: &str = "DWL";
    pub const MAKE_TEST_FILE: &str = "MTS";
    pub const SENSOR_OXYGEN: &str = "GDO";
    pub const SENSOR_DEBUG: &str = "GDX";
    pub const BLE_NAME: &str = "BNA";
    pub const LOG_TOGGLE: &str = "LOG";
    pub const WAKE: &str = "WAK";
    pub const CONFIG: &str = "CFG";
    pub const XMODEM_GET: &str = "GET";
}

/// Literal answers meaning the logger refused the command.
pub const REJECTION_ANSWERS: [&[u8]; 2] = [b"ERR", b"INV"];

/// End-of-list marker closing a directory listing.
pub const END_OF_LIST: u8 = 0x04;

/// Shape of a finished answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    /// Exactly this many bytes.
    Length(usize),
    /// Starts with `"{tag} "` and is exactly this many bytes.
    TagAndLength(usize),
    /// Ends with one of these markers.
    EndsWith(&'static [&'static [u8]]),
    /// `"{tag} {hex2 n}"` followed by exactly `n` value bytes.
    SelfDelimited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Pending,
    Complete,
    /// `ERR` or `INV`.
    Rejected,
}

const LISTING_END: &[&[u8]] = &[b"\x04", b"\x04\n\r", b"\x04\r\n"];

impl Rule {
    pub fn is_satisfied(&self, tag: &str, answer: &[u8]) -> bool {
        match *self {
            Rule::Length(n) => answer.len() == n,
            Rule::TagAndLength(n) => answer.len() == n && has_tag_prefix(tag, answer),
            Rule::EndsWith(markers) => markers.iter().any(|m| answer.ends_with(m)),
            Rule::SelfDelimited => {
                if !has_tag_prefix(tag, answer) {
                    return false;
                }
                declared_value_len(answer)
                    .is_some_and(|n| answer.len() == TAG_LEN + 3 + n)
            }
        }
    }
}

fn has_tag_prefix(tag: &str, answer: &[u8]) -> bool {
    answer.len() > TAG_LEN && answer.starts_with(tag.as_bytes()) && answer[TAG_LEN] == b' '
}

/// Parse the two hex digits after `"{tag} "`.
pub(crate) fn declared_value_len(answer: &[u8]) -> Option<usize> {
    let digits = answer.get(TAG_LEN + 1..TAG_LEN + 3)?;
    let digits = std::str::from_utf8(digits).ok()?;
    usize::from_str_radix(digits, 16).ok()
}

pub fn is_rejection(answer: &[u8]) -> bool {
    REJECTION_ANSWERS.iter().any(|r| *r == answer)
}

type Entries = &'static [(&'static str, Rule)];

/// One family's completion table: the shared command set plus the
/// family's own tags, which take precedence.
#[derive(Debug, Clone, Copy)]
pub struct RuleTable {
    shared: Entries,
    family: Entries,
}

impl RuleTable {
    pub const fn new(shared: Entries, family: Entries) -> Self {
        Self { shared, family }
    }

    pub fn rule_for(&self, tag: &str) -> Option<Rule> {
        self.family
            .iter()
            .chain(self.shared)
            .find(|(t, _)| *t == tag)
            .map(|(_, rule)| *rule)
    }

    pub fn tags(&self) -> impl Iterator<Item = &'static str> {
        self.family.iter().chain(self.shared).map(|(t, _)| *t)
    }

    /// Decide whether `answer` finishes a `tag` transaction.
    ///
    /// Rejections win over every tag rule. Unknown tags never complete,
    /// they run into their timeout.
    pub fn evaluate(&self, tag: &str, answer: &[u8]) -> Completion {
        if is_rejection(answer) {
            return Completion::Rejected;
        }
        match self.rule_for(tag) {
            Some(rule) if rule.is_satisfied(tag, answer) => Completion::Complete,
            _ => Completion::Pending,
        }
    }
}

/// Answer shapes common to every family.
const SHARED_RULES: Entries = &[
    (STATUS, Rule::TagAndLength(8)),
    (FIRMWARE_VERSION, Rule::TagAndLength(12)),
    (GET_TIME, Rule::TagAndLength(25)),
    (SET_TIME, Rule::TagAndLength(6)),
    (DIR, Rule::EndsWith(LISTING_END)),
    (DELETE, Rule::TagAndLength(6)),
    (RUN, Rule::TagAndLength(6)),
    (RUN_WITH_STRING, Rule::TagAndLength(6)),
    (STOP, Rule::TagAndLength(6)),
    (STOP_WITH_STRING, Rule::TagAndLength(6)),
    (FORMAT, Rule::TagAndLength(6)),
    (FILE_SIZE, Rule::SelfDelimited),
    (FILE_CRC, Rule::TagAndLength(14)),
    (BATTERY, Rule::TagAndLength(10)),
    (LED, Rule::TagAndLength(6)),
    (READ_LOGGER_INFO, Rule::SelfDelimited),
    (WRITE_LOGGER_INFO, Rule::TagAndLength(6)),
    (READ_HOST_STORAGE, Rule::SelfDelimited),
    (WRITE_HOST_STORAGE, Rule::TagAndLength(6)),
    (UP_TIME, Rule::SelfDelimited),
    (RESET, Rule::TagAndLength(6)),
];

pub static CC26X2_RULES: RuleTable = RuleTable::new(
    SHARED_RULES,
    &[
        (DOWNLOAD_STAGE, Rule::TagAndLength(6)),
        (MAKE_TEST_FILE, Rule::TagAndLength(6)),
        (SENSOR_OXYGEN, Rule::SelfDelimited),
        (SENSOR_DEBUG, Rule::SelfDelimited),
        (BLE_NAME, Rule::SelfDelimited),
        (LOG_TOGGLE, Rule::TagAndLength(8)),
        (WAKE, Rule::TagAndLength(8)),
        (CONFIG, Rule::TagAndLength(6)),
    ],
);

pub static RN4020_RULES: RuleTable =
    RuleTable::new(SHARED_RULES, &[(XMODEM_GET, Rule::TagAndLength(6))]);

/// Per-tag time budget with one fallback.
#[derive(Debug, Clone)]
pub struct TimeoutTable {
    default: Duration,
    per_tag: HashMap<String, Duration>,
}

/// Budgets for operations the firmware takes seconds to finish.
const SLOW_TAGS: &[(&str, u64)] = &[
    (RUN, 20),
    (RUN_WITH_STRING, 30),
    (STOP, 15),
    (STOP_WITH_STRING, 15),
    (FORMAT, 30),
    (MAKE_TEST_FILE, 60),
    (SENSOR_OXYGEN, 20),
    (SENSOR_DEBUG, 20),
    (DELETE, 15),
];

impl TimeoutTable {
    pub fn new(default: Duration) -> Self {
        let per_tag = SLOW_TAGS
            .iter()
            .map(|(tag, secs)| (tag.to_string(), Duration::from_secs(*secs)))
            .collect();
        Self { default, per_tag }
    }

    pub fn with_override(mut self, tag: &str, budget: Duration) -> Self {
        self.per_tag.insert(tag.to_string(), budget);
        self
    }

    pub fn timeout(&self, tag: &str) -> Duration {
        self.per_tag.get(tag).copied().unwrap_or(self.default)
    }
}

impl Default for TimeoutTable {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Answers a logger gives, one per tag.
    fn sample_answers() -> Vec<(&'static str, &'static [u8])> {
        vec![
            (STATUS, b"STS 0201"),
            (FIRMWARE_VERSION, b"GFV 061.2.34"),
            (GET_TIME, b"GTM 132024/03/05 10:20:30"),
            (SET_TIME, b"STM 00"),
            (DIR, b"a.lid\t\t\t1024\n\r\x04\n\r"),
            (BATTERY, b"BAT 04E80C"),
            (FILE_CRC, b"CRC 08cbf43926"),
            (FILE_SIZE, b"SIZ 0512345"),
            (READ_LOGGER_INFO, b"RLI 09SN1234567"),
            (RUN, b"RUN 00"),
        ]
    }

    #[test]
    fn test_every_full_answer_completes() {
        for (tag, answer) in sample_answers() {
            assert_eq!(
                CC26X2_RULES.evaluate(tag, answer),
                Completion::Complete,
                "{tag} should complete on {answer:?}"
            );
        }
    }

    #[test]
    fn test_strict_prefixes_stay_pending() {
        for (tag, answer) in sample_answers() {
            for end in 0..answer.len() {
                let prefix = &answer[..end];
                // the listing is complete as soon as its marker shows up
                if tag == DIR && prefix.ends_with(b"\x04") {
                    continue;
                }
                assert_eq!(
                    CC26X2_RULES.evaluate(tag, prefix),
                    Completion::Pending,
                    "{tag} prefix {prefix:?} must not complete"
                );
            }
        }
    }

    /// A well-formed answer for `tag` built from the shape of its rule.
    fn answer_for(tag: &str, rule: Rule) -> Vec<u8> {
        match rule {
            Rule::Length(n) => vec![b'a'; n],
            Rule::TagAndLength(n) => {
                let value_len = n - (TAG_LEN + 3);
                format!("{tag} {value_len:02x}{}", "7".repeat(value_len)).into_bytes()
            }
            Rule::SelfDelimited => format!("{tag} 05abcde").into_bytes(),
            Rule::EndsWith(markers) => {
                let mut listing = b"a.lid\t\t\t1024\n\r".to_vec();
                listing.extend_from_slice(markers[0]);
                listing
            }
        }
    }

    fn answers_for(table: &RuleTable) -> Vec<(&'static str, Vec<u8>)> {
        table
            .tags()
            .filter_map(|tag| table.rule_for(tag).map(|rule| (tag, answer_for(tag, rule))))
            .collect()
    }

    #[test]
    fn test_every_tag_completes_only_on_full_answer() {
        for table in [&CC26X2_RULES, &RN4020_RULES] {
            let answers = answers_for(table);
            assert_eq!(answers.len(), table.tags().count());
            for (tag, answer) in answers {
                assert_eq!(
                    table.evaluate(tag, &answer),
                    Completion::Complete,
                    "{tag} should complete on {answer:?}"
                );
                for end in 0..answer.len() {
                    assert_eq!(
                        table.evaluate(tag, &answer[..end]),
                        Completion::Pending,
                        "{tag} prefix {:?} must not complete",
                        &answer[..end]
                    );
                }
            }
        }
    }

    #[test]
    fn test_family_tags_are_covered() {
        let cc: Vec<_> = CC26X2_RULES.tags().collect();
        for tag in [
            DOWNLOAD_STAGE,
            MAKE_TEST_FILE,
            SENSOR_OXYGEN,
            SENSOR_DEBUG,
            BLE_NAME,
            LOG_TOGGLE,
            WAKE,
            CONFIG,
            DELETE,
            STOP,
            STOP_WITH_STRING,
            FORMAT,
            LED,
            WRITE_LOGGER_INFO,
            READ_HOST_STORAGE,
            WRITE_HOST_STORAGE,
            UP_TIME,
            RESET,
        ] {
            assert!(cc.contains(&tag), "{tag} missing from CC26x2 table");
        }
        assert!(RN4020_RULES.tags().any(|t| t == XMODEM_GET));
    }

    #[test]
    fn test_wrapped_rn4020_answers_complete_only_when_whole() {
        use crate::variant::{HardwareVariant, Rn4020, RN4020_HEAD, RN4020_TAIL};

        for (tag, answer) in answers_for(&RN4020_RULES) {
            let wrapped = [RN4020_HEAD, &answer[..], RN4020_TAIL].concat();
            let verdict = |raw: &[u8]| match Rn4020.trim(raw) {
                Some(body) => RN4020_RULES.evaluate(tag, body),
                None => Completion::Pending,
            };
            assert_eq!(verdict(&wrapped), Completion::Complete, "{tag}");
            for end in 0..wrapped.len() {
                assert_eq!(
                    verdict(&wrapped[..end]),
                    Completion::Pending,
                    "{tag} prefix {:?} must not complete",
                    &wrapped[..end]
                );
            }
        }
    }

    #[test]
    fn test_rejection_short_circuits_every_tag() {
        for tag in CC26X2_RULES.tags().chain(["XYZ"]) {
            assert_eq!(CC26X2_RULES.evaluate(tag, b"ERR"), Completion::Rejected);
            assert_eq!(CC26X2_RULES.evaluate(tag, b"INV"), Completion::Rejected);
        }
        assert_eq!(
            CC26X2_RULES.evaluate(STATUS, b"ERR "),
            Completion::Pending
        );
    }

    #[test]
    fn test_unknown_tag_never_completes() {
        assert!(CC26X2_RULES.rule_for("XYZ").is_none());
        assert_eq!(CC26X2_RULES.evaluate("XYZ", b"XYZ 00"), Completion::Pending);
    }

    #[test]
    fn test_tag_prefix_is_checked() {
        assert_eq!(CC26X2_RULES.evaluate(STATUS, b"GTM 0201"), Completion::Pending);
        assert_eq!(CC26X2_RULES.evaluate(RUN, b"RUN 00"), Completion::Complete);
    }

    #[test]
    fn test_self_delimited_overrun_is_pending() {
        assert_eq!(
            CC26X2_RULES.evaluate(FILE_SIZE, b"SIZ 05123456"),
            Completion::Pending
        );
        assert_eq!(CC26X2_RULES.evaluate(FILE_SIZE, b"SIZ zz1"), Completion::Pending);
    }

    #[test]
    fn test_plain_length_rule() {
        let rule = Rule::Length(3);
        assert!(rule.is_satisfied("XYZ", b"abc"));
        assert!(!rule.is_satisfied("XYZ", b"ab"));
        assert!(!rule.is_satisfied("XYZ", b"abcd"));
    }

    #[test]
    fn test_empty_listing() {
        assert_eq!(CC26X2_RULES.evaluate(DIR, b"\x04"), Completion::Complete);
        assert_eq!(CC26X2_RULES.evaluate(DIR, b"\x04\n\r"), Completion::Complete);
    }

    #[test]
    fn test_family_specific_tags() {
        assert!(CC26X2_RULES.rule_for(DOWNLOAD_STAGE).is_some());
        assert!(CC26X2_RULES.rule_for(XMODEM_GET).is_none());
        assert!(RN4020_RULES.rule_for(XMODEM_GET).is_some());
        assert!(RN4020_RULES.rule_for(DOWNLOAD_STAGE).is_none());
    }

    #[test]
    fn test_timeout_table() {
        let table = TimeoutTable::default();
        assert_eq!(table.timeout(STATUS), Duration::from_secs(10));
        assert_eq!(table.timeout(RUN), Duration::from_secs(20));
        assert_eq!(table.timeout(MAKE_TEST_FILE), Duration::from_secs(60));

        let table = table.with_override(STATUS, Duration::from_secs(3));
        assert_eq!(table.timeout(STATUS), Duration::from_secs(3));
        assert_eq!(table.timeout("XYZ"), Duration::from_secs(10));
    }
}
