//! One command, one answer.
//!
//! A transaction resets the accumulator, writes the encoded frame and then
//! re-evaluates the family's completion rule every time a fragment lands,
//! until the answer completes, the logger rejects the command, or the
//! tag's budget runs out. Once fragments start arriving, a silence longer
//! than the fragment grace ends the wait early.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::accumulator::{AccumulatorMode, AnswerAccumulator};
use crate::ble::{self, BleLink};
use crate::codec::{self, Frame};
use crate::error::EngineError;
use crate::rules::{Completion, TimeoutTable};
use crate::variant::HardwareVariant;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TransactionState {
    #[default]
    Idle,
    Sent {
        tag: String,
        deadline: Instant,
    },
    Complete {
        tag: String,
    },
    TimedOut {
        tag: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerStatus {
    Complete,
    /// Budget ran out with bytes in the buffer.
    Incomplete,
}

/// Answer bytes with the family framing removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub tag: String,
    pub status: AnswerStatus,
    pub bytes: Vec<u8>,
}

impl Answer {
    pub fn is_complete(&self) -> bool {
        self.status == AnswerStatus::Complete
    }

    /// Treat a partial answer as the timeout it is.
    pub fn into_complete(self) -> Result<Vec<u8>, EngineError> {
        match self.status {
            AnswerStatus::Complete => Ok(self.bytes),
            AnswerStatus::Incomplete => Err(EngineError::Timeout {
                tag: self.tag,
                partial: self.bytes,
            }),
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

#[derive(Debug, Clone)]
pub struct CommandTransactor {
    timeouts: TimeoutTable,
    grace: Duration,
    state: TransactionState,
}

impl CommandTransactor {
    pub fn new(timeouts: TimeoutTable, grace: Duration) -> Self {
        Self {
            timeouts,
            grace,
            state: TransactionState::Idle,
        }
    }

    pub fn state(&self) -> &TransactionState {
        &self.state
    }

    pub fn timeouts(&self) -> &TimeoutTable {
        &self.timeouts
    }

    /// Send `command` and wait for its answer.
    pub async fn execute(
        &mut self,
        link: &mut dyn BleLink,
        accumulator: &AnswerAccumulator,
        variant: &dyn HardwareVariant,
        command: &str,
        argument: Option<&str>,
    ) -> Result<Answer, EngineError> {
        let frame = codec::encode(command, argument)?;
        let deadline = self.send(link, accumulator, variant, &frame).await?;
        self.await_answer(accumulator, variant, &frame.tag, deadline)
            .await
    }

    async fn send(
        &mut self,
        link: &mut dyn BleLink,
        accumulator: &AnswerAccumulator,
        variant: &dyn HardwareVariant,
        frame: &Frame,
    ) -> Result<Instant, EngineError> {
        accumulator.set_mode(AccumulatorMode::Command);
        accumulator.reset();

        if variant.rules().rule_for(&frame.tag).is_none() {
            warn!(
                tag = %frame.tag,
                family = %variant.family(),
                "no completion rule for tag, answer can only time out"
            );
        }

        debug!(tag = %frame.tag, len = frame.bytes.len(), "sending command");
        ble::write_all(link, &frame.bytes).await?;

        let deadline = Instant::now() + self.timeouts.timeout(&frame.tag);
        self.state = TransactionState::Sent {
            tag: frame.tag.clone(),
            deadline,
        };
        Ok(deadline)
    }

    async fn await_answer(
        &mut self,
        accumulator: &AnswerAccumulator,
        variant: &dyn HardwareVariant,
        tag: &str,
        deadline: Instant,
    ) -> Result<Answer, EngineError> {
        loop {
            let (verdict, trimmed) = accumulator.with_command(|raw| {
                match variant.trim(raw) {
                    Some(body) => match variant.rules().evaluate(tag, body) {
                        Completion::Pending => (Completion::Pending, None),
                        done => (done, Some(body.to_vec())),
                    },
                    None => (Completion::Pending, None),
                }
            });

            match (verdict, trimmed) {
                (Completion::Complete, Some(bytes)) => {
                    trace!(tag, len = bytes.len(), "answer complete");
                    self.state = TransactionState::Complete {
                        tag: tag.to_string(),
                    };
                    return Ok(Answer {
                        tag: tag.to_string(),
                        status: AnswerStatus::Complete,
                        bytes,
                    });
                }
                (Completion::Rejected, Some(bytes)) => {
                    debug!(tag, "logger rejected command");
                    self.state = TransactionState::Complete {
                        tag: tag.to_string(),
                    };
                    return Err(EngineError::Protocol {
                        tag: tag.to_string(),
                        answer: String::from_utf8_lossy(&bytes).into_owned(),
                    });
                }
                _ => {}
            }

            let wake_by = match accumulator.last_fragment_at() {
                Some(at) => deadline.min(at + self.grace),
                None => deadline,
            };
            if Instant::now() >= wake_by {
                break;
            }
            accumulator.wait_fragment(wake_by).await;
        }

        self.state = TransactionState::TimedOut {
            tag: tag.to_string(),
        };
        let partial = accumulator.take_command();
        if partial.is_empty() {
            debug!(tag, "no answer before timeout");
            return Err(EngineError::Timeout {
                tag: tag.to_string(),
                partial,
            });
        }
        warn!(tag, len = partial.len(), "answer incomplete at timeout");
        let bytes = variant.strip_partial(&partial).to_vec();
        Ok(Answer {
            tag: tag.to_string(),
            status: AnswerStatus::Incomplete,
            bytes,
        })
    }
}

impl Default for CommandTransactor {
    fn default() -> Self {
        Self::new(TimeoutTable::default(), Duration::from_secs(3))
    }
}
