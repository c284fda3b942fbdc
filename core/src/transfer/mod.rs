//! Bulk file retrieval.
//!
//! Both protocols run with the accumulator in file mode, held by a
//! [`FileModeGuard`](crate::accumulator::FileModeGuard) so that command mode
//! and an empty file buffer come back on every exit path, including a
//! dropped future. The result is always exactly the declared size; fewer
//! bytes is a failure, never a short file.

pub mod chunked;
pub mod xmodem;

pub use chunked::ChunkedTransfer;
pub use xmodem::{XModemState, XModemTransfer};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::accumulator::AnswerAccumulator;
use crate::error::{EngineError, TransferFailure};

/// Wait until the file buffer holds at least `len` bytes.
///
/// `Ok(false)` once `deadline` passes, `Err` when `cancel` fires first.
pub(crate) async fn wait_for_file_len(
    accumulator: &AnswerAccumulator,
    len: usize,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<bool, EngineError> {
    loop {
        if accumulator.file_len() >= len {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(TransferFailure::Cancelled.into()),
            _ = accumulator.wait_fragment(deadline) => {}
        }
    }
}

/// Cut the assembled file to the declared size.
pub(crate) fn finish(mut data: Vec<u8>, declared_size: usize) -> Result<Vec<u8>, EngineError> {
    if data.len() < declared_size {
        return Err(TransferFailure::SizeMismatch {
            expected: declared_size as u64,
            received: data.len() as u64,
        }
        .into());
    }
    data.truncate(declared_size);
    Ok(data)
}
