pub mod accumulator;
pub mod agent;
pub mod answers;
pub mod ble;
pub mod ble_mock;
pub mod codec;
pub mod config;
pub mod error;
pub mod ffi;
pub mod rules;
pub mod session;
pub mod transactor;
pub mod transfer;
pub mod variant;

uniffi::setup_scaffolding!();

pub use accumulator::{AccumulatorMode, AnswerAccumulator, NotificationSink};
pub use agent::{spawn, SessionHandle};
pub use answers::{FileEntry, LoggerStatus};
pub use ble::{BleConnector, BleDeviceInfo, BleLink, GattProfile};
pub use config::{load_config, EngineConfig};
pub use error::{AnswerError, ConfigError, EngineError, TransferFailure, TransportError};
pub use rules::{Completion, Rule, RuleTable, TimeoutTable};
pub use session::Session;
pub use transactor::{Answer, AnswerStatus, CommandTransactor, TransactionState};
pub use transfer::{ChunkedTransfer, XModemTransfer};
pub use variant::{detect_family, FileProtocol, HardwareFamily, HardwareVariant};
