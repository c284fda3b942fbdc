//! Indexed chunk download.
//!
//! After `DWG name` stages a file, `DWL {index}` asks for its index-th
//! chunk. The logger answers with raw file bytes and no framing, so the end
//! of a chunk is only visible as the buffer reaching the next chunk
//! boundary. The last chunk is short; it is recognised by silence.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::accumulator::{AnswerAccumulator, FileModeGuard};
use crate::ble::{self, BleLink};
use crate::codec;
use crate::config::ChunkedSettings;
use crate::error::{EngineError, TransferFailure};
use crate::rules::tags;

use super::finish;

/// How a chunk request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkEnd {
    /// Buffer reached the chunk boundary or the declared size.
    Filled,
    /// Nothing arrived for the silence timeout, or the chunk ceiling passed.
    Quiet,
}

#[derive(Debug, Clone, Default)]
pub struct ChunkedTransfer {
    settings: ChunkedSettings,
}

impl ChunkedTransfer {
    pub fn new(settings: ChunkedSettings) -> Self {
        Self { settings }
    }

    /// Fetch chunks until `declared_size` bytes are in or the logger goes
    /// quiet. The file must already be staged with `DWG`.
    pub async fn run(
        &self,
        link: &mut dyn BleLink,
        accumulator: &AnswerAccumulator,
        declared_size: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, EngineError> {
        let _file_mode = FileModeGuard::enter(accumulator);
        let chunk_size = self.settings.chunk_size;

        let mut index = 0usize;
        while accumulator.file_len() < declared_size {
            let frame = codec::encode(tags::DOWNLOAD_CHUNK, Some(&index.to_string()))?;
            ble::write_all(link, &frame.bytes).await?;
            let sent_at = Instant::now();

            let target = ((index + 1) * chunk_size).min(declared_size);
            let end = self.await_chunk(accumulator, target, sent_at, cancel).await?;
            trace!(index, received = accumulator.file_len(), ?end, "chunk done");
            if end == ChunkEnd::Quiet {
                debug!(
                    index,
                    received = accumulator.file_len(),
                    declared_size,
                    "logger went quiet"
                );
                break;
            }
            index += 1;
        }

        let data = finish(accumulator.take_file(), declared_size)?;
        debug!(bytes = data.len(), chunks = index + 1, "chunked download complete");
        Ok(data)
    }

    async fn await_chunk(
        &self,
        accumulator: &AnswerAccumulator,
        target: usize,
        sent_at: Instant,
        cancel: &CancellationToken,
    ) -> Result<ChunkEnd, EngineError> {
        let silence = Duration::from_millis(self.settings.silence_timeout_ms);
        let ceiling = sent_at + Duration::from_millis(self.settings.chunk_timeout_ms);
        loop {
            if accumulator.file_len() >= target {
                return Ok(ChunkEnd::Filled);
            }
            let heard = accumulator
                .last_fragment_at()
                .map_or(sent_at, |at| at.max(sent_at));
            let wake = ceiling.min(heard + silence);
            if Instant::now() >= wake {
                return Ok(ChunkEnd::Quiet);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransferFailure::Cancelled.into()),
                _ = accumulator.wait_fragment(wake) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::accumulator::{AccumulatorMode, NotificationSink};
    use crate::ble::{BleConnector, BleDeviceInfo};
    use crate::ble_mock::{sample_bytes, MockLogger, ScriptedLink};
    use crate::variant::{HardwareFamily, CC26X2_PROFILE};

    async fn staged(
        logger: &MockLogger,
        name: &str,
    ) -> (Arc<AnswerAccumulator>, Box<dyn BleLink>) {
        let acc = Arc::new(AnswerAccumulator::new());
        let device: BleDeviceInfo = logger.device();
        let mut link = logger
            .clone()
            .connect(&device, &CC26X2_PROFILE, NotificationSink::new(acc.clone()))
            .await
            .unwrap();
        let frame = codec::encode(tags::DOWNLOAD_STAGE, Some(name)).unwrap();
        ble::write_all(link.as_mut(), &frame.bytes).await.unwrap();
        acc.reset();
        (acc, link)
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_chunks_for_5000_bytes() {
        let logger = MockLogger::with_sample_data(HardwareFamily::Cc26x2, "04:EE:03:00:00:01");
        let (acc, mut link) = staged(&logger, "2024-03-05_data.lid").await;

        let data = ChunkedTransfer::default()
            .run(link.as_mut(), &acc, 5000, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(data.len(), 5000);
        assert_eq!(data, sample_bytes(5000));
        let requests: Vec<String> = logger
            .commands()
            .into_iter()
            .filter(|c| c.starts_with(tags::DOWNLOAD_CHUNK))
            .collect();
        assert_eq!(requests, vec!["DWL 010", "DWL 011", "DWL 012"]);
        assert_eq!(acc.mode(), AccumulatorMode::Command);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exact_multiple_of_chunk_size() {
        let logger = MockLogger::new(HardwareFamily::Cc26x2, "04:EE:03:00:00:01");
        logger.add_file("even.lid", sample_bytes(4096));
        let (acc, mut link) = staged(&logger, "even.lid").await;

        let data = ChunkedTransfer::default()
            .run(link.as_mut(), &acc, 4096, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(data, sample_bytes(4096));
        assert_eq!(logger.commands_with_tag(tags::DOWNLOAD_CHUNK), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_logger_is_size_mismatch() {
        let logger = MockLogger::with_sample_data(HardwareFamily::Cc26x2, "04:EE:03:00:00:01");
        logger.limit_chunks(1);
        let (acc, mut link) = staged(&logger, "2024-03-05_data.lid").await;

        let started = Instant::now();
        let err = ChunkedTransfer::default()
            .run(link.as_mut(), &acc, 5000, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::TransferFailed(TransferFailure::SizeMismatch {
                expected: 5000,
                received: 2048
            })
        );
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(2) && waited < Duration::from_secs(3));
        assert_eq!(acc.file_len(), 0);
        assert_eq!(acc.mode(), AccumulatorMode::Command);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_file_sends_no_requests() {
        let acc = Arc::new(AnswerAccumulator::new());
        let mut link = ScriptedLink::new(NotificationSink::new(acc.clone()), vec![]);

        let data = ChunkedTransfer::default()
            .run(&mut link, &acc, 0, &CancellationToken::new())
            .await
            .unwrap();
        assert!(data.is_empty());
        assert!(link.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_transfer() {
        let acc = Arc::new(AnswerAccumulator::new());
        let mut link = ScriptedLink::new(
            NotificationSink::new(acc.clone()),
            vec![sample_bytes(100)],
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = ChunkedTransfer::default()
            .run(&mut link, &acc, 5000, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::TransferFailed(TransferFailure::Cancelled));
        assert_eq!(acc.mode(), AccumulatorMode::Command);
        assert_eq!(acc.file_len(), 0);
    }
}
