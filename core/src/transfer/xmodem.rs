//! XMODEM-CRC receiver.
//!
//! The logger is the sender. We open with `'C'` to ask for CRC-16 frames,
//! then answer every frame with ACK or NAK until EOT. A frame is
//!
//! ```text
//! [SOH|STX] [block] [!block] [payload: 128|1024] [crc16 hi] [crc16 lo]
//! ```
//!
//! and the last frame is padded with SUB (`0x1A`), which is cut off by
//! truncating to the size the logger declared before the transfer.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::accumulator::{AnswerAccumulator, FileModeGuard};
use crate::ble::{self, BleLink};
use crate::codec;
use crate::config::XModemSettings;
use crate::error::{EngineError, TransferFailure};

use super::{finish, wait_for_file_len};

pub mod control {
    pub const SOH: u8 = 0x01;
    pub const STX: u8 = 0x02;
    pub const EOT: u8 = 0x04;
    pub const ACK: u8 = 0x06;
    pub const NAK: u8 = 0x15;
    pub const CAN: u8 = 0x18;
    /// Receiver's opening byte, asking for CRC-16 frames.
    pub const CRC_REQUEST: u8 = b'C';
}

pub const SOH_PAYLOAD: usize = 128;
pub const STX_PAYLOAD: usize = 1024;
pub const PADDING: u8 = 0x1a;

/// Control byte, block number and its complement.
const HEADER_LEN: usize = 3;
const CRC_LEN: usize = 2;
/// CAN bytes sent when we abort.
const CANCEL_REPEAT: usize = 3;

/// Full length of a frame whose payload is `payload_len` bytes.
pub const fn frame_len(payload_len: usize) -> usize {
    HEADER_LEN + payload_len + CRC_LEN
}

/// Sender side framing, used by test loggers.
pub fn build_frame(block: u8, payload: &[u8]) -> Vec<u8> {
    let start = if payload.len() == STX_PAYLOAD {
        control::STX
    } else {
        control::SOH
    };
    let mut frame = Vec::with_capacity(frame_len(payload.len()));
    frame.push(start);
    frame.push(block);
    frame.push(!block);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&codec::crc16(payload).to_be_bytes());
    frame
}

/// Where the receiver is in the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XModemState {
    AwaitingControl,
    /// Control byte seen, waiting for the rest of a frame this long.
    AwaitingFrame { frame_len: usize },
    Done,
    Aborted,
}

/// Outcome of checking one complete frame.
#[derive(Debug, PartialEq, Eq)]
enum FrameCheck {
    Accepted,
    /// Resend of the block we already have; the sender missed our ACK.
    Duplicate,
    Rejected(&'static str),
}

/// Receiver progress for one file.
#[derive(Debug)]
struct Receiver {
    state: XModemState,
    data: Vec<u8>,
    expected_block: u8,
    retries: u32,
    first_frame_seen: bool,
}

impl Receiver {
    fn new(declared_size: usize) -> Self {
        Self {
            state: XModemState::AwaitingControl,
            data: Vec::with_capacity(declared_size),
            expected_block: 1,
            retries: 0,
            first_frame_seen: false,
        }
    }

    fn check(&mut self, frame: &[u8], validate_blocks: bool) -> FrameCheck {
        let payload_end = frame.len() - CRC_LEN;
        let payload = &frame[HEADER_LEN..payload_end];
        let crc = [frame[payload_end], frame[payload_end + 1]];
        if !codec::verify_crc16(payload, crc) {
            return FrameCheck::Rejected("crc mismatch");
        }

        let (block, complement) = (frame[1], frame[2]);
        if validate_blocks {
            if block != !complement {
                return FrameCheck::Rejected("block complement mismatch");
            }
            if self.first_frame_seen && block == self.expected_block.wrapping_sub(1) {
                return FrameCheck::Duplicate;
            }
            if block != self.expected_block {
                return FrameCheck::Rejected("block out of sequence");
            }
        }

        self.data.extend_from_slice(payload);
        self.expected_block = self.expected_block.wrapping_add(1);
        self.first_frame_seen = true;
        self.retries = 0;
        FrameCheck::Accepted
    }
}

/// Pulls one staged file over XMODEM-CRC.
#[derive(Debug, Clone, Default)]
pub struct XModemTransfer {
    settings: XModemSettings,
}

impl XModemTransfer {
    pub fn new(settings: XModemSettings) -> Self {
        Self { settings }
    }

    /// Receive exactly `declared_size` bytes.
    ///
    /// The file must already be staged with `GET`. On failure the logger is
    /// sent CAN so it leaves its transfer state too.
    pub async fn run(
        &self,
        link: &mut dyn BleLink,
        accumulator: &AnswerAccumulator,
        declared_size: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, EngineError> {
        let _file_mode = FileModeGuard::enter(accumulator);
        let mut rx = Receiver::new(declared_size);

        debug!(declared_size, "starting XMODEM receive");
        let outcome = self
            .receive(link, accumulator, &mut rx, declared_size, cancel)
            .await;
        match &outcome {
            Ok(_) => debug!(bytes = rx.data.len(), "XMODEM receive complete"),
            Err(EngineError::TransferFailed(TransferFailure::RemoteCancelled)) => {
                warn!("logger cancelled XMODEM transfer")
            }
            Err(e) => {
                warn!(error = %e, retries = rx.retries, state = ?rx.state, "aborting XMODEM transfer");
                rx.state = XModemState::Aborted;
                if !matches!(e, EngineError::Transport(_)) {
                    // Best effort; the logger times out on its own otherwise.
                    let _ = send_cancel(link).await;
                }
            }
        }
        outcome?;
        finish(std::mem::take(&mut rx.data), declared_size)
    }

    async fn receive(
        &self,
        link: &mut dyn BleLink,
        accumulator: &AnswerAccumulator,
        rx: &mut Receiver,
        declared_size: usize,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let control_timeout = Duration::from_millis(self.settings.control_timeout_ms);
        let frame_timeout = Duration::from_millis(self.settings.frame_timeout_ms);

        send_byte(link, control::CRC_REQUEST).await?;
        loop {
            rx.state = XModemState::AwaitingControl;
            let deadline = Instant::now() + control_timeout;
            if !wait_for_file_len(accumulator, 1, deadline, cancel).await? {
                debug!(first_frame_seen = rx.first_frame_seen, "no control byte");
                let reply = if rx.first_frame_seen {
                    control::NAK
                } else {
                    control::CRC_REQUEST
                };
                self.reject(link, accumulator, rx, reply).await?;
                continue;
            }

            let Some(start) = accumulator.peek_file() else {
                continue;
            };
            let payload_len = match start {
                control::SOH => SOH_PAYLOAD,
                control::STX => STX_PAYLOAD,
                control::EOT => {
                    accumulator.drain_file(1);
                    send_byte(link, control::ACK).await?;
                    rx.state = XModemState::Done;
                    if rx.data.len() < declared_size {
                        warn!(
                            received = rx.data.len(),
                            declared_size, "EOT before the declared size"
                        );
                    }
                    return Ok(());
                }
                control::CAN => {
                    accumulator.clear_file();
                    send_byte(link, control::ACK).await?;
                    rx.state = XModemState::Aborted;
                    return Err(TransferFailure::RemoteCancelled.into());
                }
                other => {
                    debug!(byte = other, "unexpected control byte");
                    self.reject(link, accumulator, rx, control::NAK).await?;
                    continue;
                }
            };

            let frame_len = frame_len(payload_len);
            rx.state = XModemState::AwaitingFrame { frame_len };
            let deadline = Instant::now() + frame_timeout;
            if !wait_for_file_len(accumulator, frame_len, deadline, cancel).await? {
                debug!(
                    frame_len,
                    received = accumulator.file_len(),
                    "frame timed out"
                );
                self.reject(link, accumulator, rx, control::NAK).await?;
                continue;
            }
            let Some(frame) = accumulator.drain_file(frame_len) else {
                continue;
            };

            match rx.check(&frame, self.settings.validate_block_numbers) {
                FrameCheck::Accepted => {
                    trace!(block = frame[1], received = rx.data.len(), "frame accepted");
                    send_byte(link, control::ACK).await?;
                }
                FrameCheck::Duplicate => {
                    trace!(block = frame[1], "duplicate frame");
                    send_byte(link, control::ACK).await?;
                }
                FrameCheck::Rejected(reason) => {
                    debug!(block = frame[1], reason, "frame rejected");
                    self.reject(link, accumulator, rx, control::NAK).await?;
                }
            }
        }
    }

    /// Purge whatever is buffered, answer with `reply` and count the retry.
    async fn reject(
        &self,
        link: &mut dyn BleLink,
        accumulator: &AnswerAccumulator,
        rx: &mut Receiver,
        reply: u8,
    ) -> Result<(), EngineError> {
        accumulator.clear_file();
        send_byte(link, reply).await?;
        rx.retries += 1;
        if rx.retries >= self.settings.max_retries {
            return Err(TransferFailure::ChecksumRetriesExhausted {
                retries: rx.retries,
            }
            .into());
        }
        Ok(())
    }
}

async fn send_byte(link: &mut dyn BleLink, byte: u8) -> Result<(), EngineError> {
    ble::write_all(link, &[byte]).await?;
    Ok(())
}

async fn send_cancel(link: &mut dyn BleLink) -> Result<(), EngineError> {
    for _ in 0..CANCEL_REPEAT {
        send_byte(link, control::CAN).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::accumulator::{AccumulatorMode, NotificationSink};
    use crate::ble_mock::{sample_bytes, ScriptedLink};

    fn soh_frame(block: u8, data: &[u8]) -> Vec<u8> {
        let mut payload = data.to_vec();
        payload.resize(SOH_PAYLOAD, PADDING);
        build_frame(block, &payload)
    }

    fn corrupt(mut frame: Vec<u8>) -> Vec<u8> {
        if let Some(last) = frame.last_mut() {
            *last ^= 0xff;
        }
        frame
    }

    fn setup(replies: Vec<Vec<u8>>) -> (Arc<AnswerAccumulator>, ScriptedLink) {
        let acc = Arc::new(AnswerAccumulator::new());
        let link = ScriptedLink::new(NotificationSink::new(acc.clone()), replies);
        (acc, link)
    }

    fn count(writes: &[Vec<u8>], byte: u8) -> usize {
        writes.iter().filter(|w| w.as_slice() == [byte]).count()
    }

    #[test]
    fn test_build_frame_layout() {
        let frame = soh_frame(1, b"abc");
        assert_eq!(frame.len(), 133);
        assert_eq!(&frame[..3], &[control::SOH, 0x01, 0xfe]);
        assert_eq!(frame[3..6], *b"abc");
        assert_eq!(frame[6], PADDING);

        let big = build_frame(2, &[0u8; STX_PAYLOAD]);
        assert_eq!(big.len(), 1029);
        assert_eq!(big[0], control::STX);
    }

    #[test]
    fn test_receiver_checks_blocks() {
        let mut rx = Receiver::new(256);
        assert_eq!(rx.check(&soh_frame(1, b"one"), true), FrameCheck::Accepted);
        assert_eq!(rx.check(&soh_frame(1, b"one"), true), FrameCheck::Duplicate);
        assert_eq!(
            rx.check(&soh_frame(3, b"three"), true),
            FrameCheck::Rejected("block out of sequence")
        );
        assert_eq!(rx.check(&soh_frame(2, b"two"), true), FrameCheck::Accepted);
        assert_eq!(rx.data.len(), 2 * SOH_PAYLOAD);

        let mut bad = soh_frame(3, b"x");
        bad[2] = 0x00;
        assert_eq!(
            rx.check(&bad, true),
            FrameCheck::Rejected("block complement mismatch")
        );
        assert_eq!(
            rx.check(&corrupt(soh_frame(3, b"x")), true),
            FrameCheck::Rejected("crc mismatch")
        );
    }

    #[test]
    fn test_receiver_without_block_validation() {
        let mut rx = Receiver::new(256);
        assert_eq!(rx.check(&soh_frame(7, b"a"), false), FrameCheck::Accepted);
        assert_eq!(rx.check(&soh_frame(7, b"a"), false), FrameCheck::Accepted);
        assert_eq!(rx.data.len(), 2 * SOH_PAYLOAD);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_frame_file() {
        let data = sample_bytes(100);
        let (acc, mut link) = setup(vec![soh_frame(1, &data), vec![control::EOT], vec![]]);
        let transfer = XModemTransfer::default();

        let out = transfer
            .run(&mut link, &acc, 100, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, data);
        assert_eq!(
            link.writes(),
            vec![
                vec![control::CRC_REQUEST],
                vec![control::ACK],
                vec![control::ACK]
            ]
        );
        assert_eq!(acc.mode(), AccumulatorMode::Command);
        assert_eq!(acc.file_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupted_frame_is_nakked_once() {
        let data = sample_bytes(128);
        let (acc, mut link) = setup(vec![
            corrupt(soh_frame(1, &data)),
            soh_frame(1, &data),
            vec![control::EOT],
            vec![],
        ]);
        let transfer = XModemTransfer::default();

        let out = transfer
            .run(&mut link, &acc, 128, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, data);
        let writes = link.writes();
        assert_eq!(count(&writes, control::NAK), 1);
        assert_eq!(count(&writes, control::CAN), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_bad_frames_cancel() {
        let data = sample_bytes(128);
        let bad = corrupt(soh_frame(1, &data));
        let (acc, mut link) = setup(vec![bad.clone(), bad.clone(), bad]);
        let transfer = XModemTransfer::default();

        let err = transfer
            .run(&mut link, &acc, 128, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::TransferFailed(TransferFailure::ChecksumRetriesExhausted { retries: 3 })
        );
        let writes = link.writes();
        assert_eq!(count(&writes, control::NAK), 3);
        assert_eq!(count(&writes, control::CAN), 3);
        assert_eq!(writes.last(), Some(&vec![control::CAN]));
        assert_eq!(acc.mode(), AccumulatorMode::Command);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_frame_file_is_truncated() {
        // 1024 + 128 + 148: the tail needs two padded SOH frames
        let data = sample_bytes(1300);
        let tail = STX_PAYLOAD + SOH_PAYLOAD;
        let frames = vec![
            build_frame(1, &data[..STX_PAYLOAD]),
            soh_frame(2, &data[STX_PAYLOAD..tail]),
            soh_frame(3, &data[tail..tail + SOH_PAYLOAD]),
            soh_frame(4, &data[tail + SOH_PAYLOAD..]),
            vec![control::EOT],
            vec![],
        ];
        let (acc, mut link) = setup(frames);

        let out = XModemTransfer::default()
            .run(&mut link, &acc, 1300, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.len(), 1300);
        assert_eq!(out, data);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_count_resets_after_good_frame() {
        let data = sample_bytes(256);
        let first = soh_frame(1, &data[..SOH_PAYLOAD]);
        let second = soh_frame(2, &data[SOH_PAYLOAD..]);
        let (acc, mut link) = setup(vec![
            corrupt(first.clone()),
            corrupt(first.clone()),
            first,
            corrupt(second.clone()),
            corrupt(second.clone()),
            second,
            vec![control::EOT],
            vec![],
        ]);

        let out = XModemTransfer::default()
            .run(&mut link, &acc, 256, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, data);
        let writes = link.writes();
        assert_eq!(count(&writes, control::NAK), 4);
        assert_eq!(count(&writes, control::CAN), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_eot_is_size_mismatch() {
        let data = sample_bytes(128);
        let (acc, mut link) = setup(vec![soh_frame(1, &data), vec![control::EOT], vec![]]);

        let err = XModemTransfer::default()
            .run(&mut link, &acc, 500, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::TransferFailed(TransferFailure::SizeMismatch {
                expected: 500,
                received: 128
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_cancel() {
        let (acc, mut link) = setup(vec![vec![control::CAN]]);

        let err = XModemTransfer::default()
            .run(&mut link, &acc, 128, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::TransferFailed(TransferFailure::RemoteCancelled)
        );
        assert_eq!(
            link.writes(),
            vec![vec![control::CRC_REQUEST], vec![control::ACK]]
        );
        assert_eq!(acc.mode(), AccumulatorMode::Command);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_sender_gets_crc_requests() {
        let (acc, mut link) = setup(vec![]);

        let err = XModemTransfer::default()
            .run(&mut link, &acc, 128, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::TransferFailed(TransferFailure::ChecksumRetriesExhausted { .. })
        ));
        let writes = link.writes();
        assert_eq!(count(&writes, control::CRC_REQUEST), 4);
        assert_eq!(count(&writes, control::NAK), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_restores_command_mode() {
        let (acc, mut link) = setup(vec![]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let err = XModemTransfer::default()
            .run(&mut link, &acc, 128, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::TransferFailed(TransferFailure::Cancelled));
        assert_eq!(acc.mode(), AccumulatorMode::Command);
        assert_eq!(count(&link.writes(), control::CAN), 3);
    }
}
