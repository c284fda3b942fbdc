//! Collects notification fragments pushed by the transport.
//!
//! The transport's notification callback only ever appends; every other
//! mutation comes from the session that owns the accumulator.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Which buffer incoming fragments are routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccumulatorMode {
    #[default]
    Command,
    FileTransfer,
}

#[derive(Debug, Default)]
struct Buffers {
    mode: AccumulatorMode,
    command: Vec<u8>,
    file: Vec<u8>,
    last_fragment_at: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct AnswerAccumulator {
    buffers: Mutex<Buffers>,
    arrived: Notify,
}

impl AnswerAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty both buffers and forget when the last fragment arrived.
    pub fn reset(&self) {
        let mut buffers = self.buffers.lock();
        buffers.command.clear();
        buffers.file.clear();
        buffers.last_fragment_at = None;
    }

    pub fn set_mode(&self, mode: AccumulatorMode) {
        self.buffers.lock().mode = mode;
    }

    pub fn mode(&self) -> AccumulatorMode {
        self.buffers.lock().mode
    }

    /// Append a notification payload to the buffer the mode selects.
    pub fn on_fragment(&self, fragment: &[u8]) {
        {
            let mut buffers = self.buffers.lock();
            match buffers.mode {
                AccumulatorMode::Command => buffers.command.extend_from_slice(fragment),
                AccumulatorMode::FileTransfer => buffers.file.extend_from_slice(fragment),
            }
            buffers.last_fragment_at = Some(Instant::now());
        }
        // single consumer: a stored permit covers a fragment landing
        // between a poll and the next wait
        self.arrived.notify_one();
    }

    pub fn last_fragment_at(&self) -> Option<Instant> {
        self.buffers.lock().last_fragment_at
    }

    /// Run `f` over the command buffer without copying it.
    pub fn with_command<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.buffers.lock().command)
    }

    pub fn take_command(&self) -> Vec<u8> {
        std::mem::take(&mut self.buffers.lock().command)
    }

    pub fn file_len(&self) -> usize {
        self.buffers.lock().file.len()
    }

    pub fn peek_file(&self) -> Option<u8> {
        self.buffers.lock().file.first().copied()
    }

    /// Remove and return the first `n` file bytes, or `None` if fewer arrived.
    pub fn drain_file(&self, n: usize) -> Option<Vec<u8>> {
        let mut buffers = self.buffers.lock();
        if buffers.file.len() < n {
            return None;
        }
        Some(buffers.file.drain(..n).collect())
    }

    pub fn take_file(&self) -> Vec<u8> {
        std::mem::take(&mut self.buffers.lock().file)
    }

    pub fn clear_file(&self) {
        self.buffers.lock().file.clear();
    }

    /// Wait for the next fragment. Returns `false` once `deadline` passes.
    pub async fn wait_fragment(&self, deadline: Instant) -> bool {
        tokio::time::timeout_at(deadline, self.arrived.notified())
            .await
            .is_ok()
    }
}

/// Cloneable handle the transport pushes notification payloads into.
#[derive(Debug, Clone)]
pub struct NotificationSink {
    accumulator: Arc<AnswerAccumulator>,
}

impl NotificationSink {
    pub fn new(accumulator: Arc<AnswerAccumulator>) -> Self {
        Self { accumulator }
    }

    pub fn push(&self, fragment: &[u8]) {
        self.accumulator.on_fragment(fragment);
    }
}

/// Holds the accumulator in file mode; command mode and an empty file
/// buffer come back on drop, whichever way the transfer ends.
pub struct FileModeGuard<'a> {
    accumulator: &'a AnswerAccumulator,
}

impl<'a> FileModeGuard<'a> {
    pub fn enter(accumulator: &'a AnswerAccumulator) -> Self {
        accumulator.clear_file();
        accumulator.set_mode(AccumulatorMode::FileTransfer);
        Self { accumulator }
    }
}

impl Drop for FileModeGuard<'_> {
    fn drop(&mut self) {
        self.accumulator.set_mode(AccumulatorMode::Command);
        self.accumulator.clear_file();
        tracing::trace!("accumulator back in command mode");
    }
}
