//! One open connection to one logger.
//!
//! A [`Session`] owns the link, the accumulator the link's notifications
//! land in, and the transactor. Every operation takes `&mut self`, so at
//! most one transaction is ever in flight. A transport failure closes the
//! session; after that every call returns [`EngineError::SessionClosed`].

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, NaiveDateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::accumulator::{AnswerAccumulator, NotificationSink};
use crate::answers::{self, FileEntry, LoggerStatus};
use crate::ble::{BleConnector, BleDeviceInfo, BleLink};
use crate::codec;
use crate::config::EngineConfig;
use crate::error::{EngineError, TransferFailure};
use crate::rules::tags;
use crate::transactor::{Answer, CommandTransactor, TransactionState};
use crate::transfer::{ChunkedTransfer, XModemTransfer};
use crate::variant::{detect_family, variant_for, FileProtocol, HardwareFamily, HardwareVariant};

pub struct Session {
    device: BleDeviceInfo,
    variant: &'static dyn HardwareVariant,
    link: Box<dyn BleLink>,
    accumulator: Arc<AnswerAccumulator>,
    transactor: CommandTransactor,
    config: EngineConfig,
    closed: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("address", &self.device.address)
            .field("family", &self.variant.family())
            .field("state", self.transactor.state())
            .field("closed", &self.closed)
            .finish()
    }
}

impl Session {
    /// Detect the hardware family of `device` and connect to it.
    pub async fn connect(
        connector: &mut dyn BleConnector,
        device: &BleDeviceInfo,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let family = detect_family(&device.address, &device.name, &config.detection).ok_or_else(
            || EngineError::UnsupportedDevice {
                address: device.address.clone(),
                name: device.name.clone(),
            },
        )?;
        Self::connect_as(connector, device, family, config).await
    }

    /// Connect treating `device` as a `family` logger.
    pub async fn connect_as(
        connector: &mut dyn BleConnector,
        device: &BleDeviceInfo,
        family: HardwareFamily,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let variant = variant_for(family);
        let accumulator = Arc::new(AnswerAccumulator::new());
        let link = connector
            .connect(
                device,
                &variant.gatt_profile(),
                NotificationSink::new(accumulator.clone()),
            )
            .await?;
        info!(address = %device.address, %family, "connected");

        let transactor = CommandTransactor::new(
            config.timeout_table(),
            Duration::from_millis(config.command.fragment_grace_ms),
        );
        Ok(Self {
            device: device.clone(),
            variant,
            link,
            accumulator,
            transactor,
            config,
            closed: false,
        })
    }

    pub fn address(&self) -> &str {
        &self.device.address
    }

    pub fn family(&self) -> HardwareFamily {
        self.variant.family()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn transaction_state(&self) -> &TransactionState {
        self.transactor.state()
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed {
            Err(EngineError::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn track<T>(&mut self, result: Result<T, EngineError>) -> Result<T, EngineError> {
        if let Err(EngineError::Transport(e)) = &result {
            warn!(address = %self.device.address, error = %e, "transport failed, closing session");
            self.closed = true;
        }
        result
    }

    /// Run one command. A partial answer at timeout comes back as an
    /// [`Answer`] with `Incomplete` status.
    pub async fn command(
        &mut self,
        command: &str,
        argument: Option<&str>,
    ) -> Result<Answer, EngineError> {
        self.ensure_open()?;
        let result = self
            .transactor
            .execute(
                self.link.as_mut(),
                &self.accumulator,
                self.variant,
                command,
                argument,
            )
            .await;
        self.track(result)
    }

    /// Run one command and require a complete answer.
    pub async fn query(
        &mut self,
        command: &str,
        argument: Option<&str>,
    ) -> Result<Vec<u8>, EngineError> {
        self.command(command, argument).await?.into_complete()
    }

    async fn acknowledge(&mut self, tag: &str, argument: Option<&str>) -> Result<(), EngineError> {
        let answer = self.query(tag, argument).await?;
        answers::parse_reply(tag, &answer)?;
        Ok(())
    }

    pub async fn status(&mut self) -> Result<LoggerStatus, EngineError> {
        let answer = self.query(tags::STATUS, None).await?;
        Ok(answers::parse_status(&answer)?)
    }

    pub async fn firmware_version(&mut self) -> Result<String, EngineError> {
        let answer = self.query(tags::FIRMWARE_VERSION, None).await?;
        Ok(answers::parse_firmware_version(&answer)?)
    }

    pub async fn battery_mv(&mut self) -> Result<u16, EngineError> {
        let answer = self.query(tags::BATTERY, None).await?;
        Ok(answers::parse_battery_mv(&answer)?)
    }

    pub async fn time(&mut self) -> Result<NaiveDateTime, EngineError> {
        let answer = self.query(tags::GET_TIME, None).await?;
        Ok(answers::parse_time(&answer)?)
    }

    pub async fn sync_time(&mut self, time: NaiveDateTime) -> Result<(), EngineError> {
        let argument = answers::format_time(&time);
        self.acknowledge(tags::SET_TIME, Some(&argument)).await
    }

    /// Set the logger clock to the host's current UTC time.
    pub async fn sync_time_now(&mut self) -> Result<NaiveDateTime, EngineError> {
        let now = DateTime::<Utc>::from(SystemTime::now()).naive_utc();
        self.sync_time(now).await?;
        Ok(now)
    }

    pub async fn ls(&mut self) -> Result<Vec<FileEntry>, EngineError> {
        let answer = self.query(tags::DIR, None).await?;
        Ok(answers::parse_directory_listing(&answer)?)
    }

    pub async fn file_size(&mut self, name: &str) -> Result<u64, EngineError> {
        let answer = self.query(tags::FILE_SIZE, Some(name)).await?;
        Ok(answers::parse_file_size(&answer)?)
    }

    pub async fn file_crc(&mut self, name: &str) -> Result<u32, EngineError> {
        let answer = self.query(tags::FILE_CRC, Some(name)).await?;
        Ok(answers::parse_file_crc(&answer)?)
    }

    pub async fn delete(&mut self, name: &str) -> Result<(), EngineError> {
        self.acknowledge(tags::DELETE, Some(name)).await
    }

    pub async fn format(&mut self) -> Result<(), EngineError> {
        self.acknowledge(tags::FORMAT, None).await
    }

    pub async fn run(&mut self) -> Result<(), EngineError> {
        self.acknowledge(tags::RUN, None).await
    }

    /// Start logging, tagging the new file with `label`.
    pub async fn run_with_string(&mut self, label: &str) -> Result<(), EngineError> {
        self.acknowledge(tags::RUN_WITH_STRING, Some(label)).await
    }

    pub async fn stop(&mut self) -> Result<(), EngineError> {
        self.acknowledge(tags::STOP, None).await
    }

    pub async fn stop_with_string(&mut self, label: &str) -> Result<(), EngineError> {
        self.acknowledge(tags::STOP_WITH_STRING, Some(label)).await
    }

    /// Stage `name` for download on the logger.
    async fn stage(&mut self, name: &str, protocol: FileProtocol) -> Result<(), EngineError> {
        let tag = match protocol {
            FileProtocol::Chunked => tags::DOWNLOAD_STAGE,
            FileProtocol::XModem => tags::XMODEM_GET,
        };
        let answer = match self.query(tag, Some(name)).await {
            Ok(answer) => answer,
            Err(EngineError::Protocol { answer, .. }) => {
                return Err(TransferFailure::NotStaged { answer }.into())
            }
            Err(e) => return Err(e),
        };
        if answers::parse_reply(tag, &answer) != Ok("") {
            return Err(TransferFailure::NotStaged {
                answer: String::from_utf8_lossy(&answer).into_owned(),
            }
            .into());
        }
        Ok(())
    }

    /// Download `name`, which the logger reported as `size` bytes.
    ///
    /// Returns exactly `size` bytes. Cancelling `cancel`, or dropping the
    /// future, leaves the session ready for the next command.
    pub async fn download(
        &mut self,
        name: &str,
        size: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, EngineError> {
        self.ensure_open()?;
        let declared = usize::try_from(size)
            .map_err(|_| EngineError::InvalidCommand(format!("file size {size} too large")))?;
        let protocol = self.variant.file_protocol();
        debug!(name, size, ?protocol, "downloading file");
        self.stage(name, protocol).await?;

        let result = match protocol {
            FileProtocol::Chunked => {
                ChunkedTransfer::new(self.config.chunked.clone())
                    .run(self.link.as_mut(), &self.accumulator, declared, cancel)
                    .await
            }
            FileProtocol::XModem => {
                XModemTransfer::new(self.config.xmodem.clone())
                    .run(self.link.as_mut(), &self.accumulator, declared, cancel)
                    .await
            }
        };
        self.track(result)
    }

    /// Download `name` and check it against the logger's own CRC32.
    pub async fn download_verified(
        &mut self,
        name: &str,
        size: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, EngineError> {
        let data = self.download(name, size, cancel).await?;
        let remote = self.file_crc(name).await?;
        let local = codec::crc32(&data);
        if local != remote {
            warn!(name, local, remote, "downloaded file fails CRC check");
            return Err(TransferFailure::CrcMismatch { local, remote }.into());
        }
        Ok(data)
    }

    /// Disconnect. Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<(), EngineError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.accumulator.reset();
        info!(address = %self.device.address, "closing session");
        self.link.disconnect().await?;
        Ok(())
    }
}
