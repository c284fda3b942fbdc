//! A [`Session`] behind a channel.
//!
//! [`spawn`] moves the session into its own task. Any number of cloned
//! [`SessionHandle`]s can then submit requests; the task serves them one at
//! a time in arrival order, which keeps the one-transaction-at-a-time rule
//! without a lock around the session.

use chrono::NaiveDateTime;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::answers::{FileEntry, LoggerStatus};
use crate::error::EngineError;
use crate::session::Session;
use crate::transactor::Answer;

/// Requests queued before the task stops accepting more.
pub const REQUEST_QUEUE_DEPTH: usize = 32;

type Responder<T> = oneshot::Sender<Result<T, EngineError>>;

#[derive(Debug)]
pub enum Request {
    Command {
        command: String,
        argument: Option<String>,
        reply: Responder<Answer>,
    },
    Status(Responder<LoggerStatus>),
    FirmwareVersion(Responder<String>),
    BatteryMv(Responder<u16>),
    Time(Responder<NaiveDateTime>),
    SyncTime {
        time: NaiveDateTime,
        reply: Responder<()>,
    },
    List(Responder<Vec<FileEntry>>),
    FileSize {
        name: String,
        reply: Responder<u64>,
    },
    FileCrc {
        name: String,
        reply: Responder<u32>,
    },
    Delete {
        name: String,
        reply: Responder<()>,
    },
    Format(Responder<()>),
    Run(Responder<()>),
    RunWithString {
        label: String,
        reply: Responder<()>,
    },
    Stop(Responder<()>),
    StopWithString {
        label: String,
        reply: Responder<()>,
    },
    Download {
        name: String,
        size: u64,
        verify: bool,
        cancel: CancellationToken,
        reply: Responder<Vec<u8>>,
    },
    /// Disconnect and end the task.
    Close(Responder<()>),
}

impl Request {
    async fn serve(self, session: &mut Session) {
        // A requester that gave up has dropped its receiver; nothing to do.
        match self {
            Request::Command {
                command,
                argument,
                reply,
            } => {
                let _ = reply.send(session.command(&command, argument.as_deref()).await);
            }
            Request::Status(reply) => {
                let _ = reply.send(session.status().await);
            }
            Request::FirmwareVersion(reply) => {
                let _ = reply.send(session.firmware_version().await);
            }
            Request::BatteryMv(reply) => {
                let _ = reply.send(session.battery_mv().await);
            }
            Request::Time(reply) => {
                let _ = reply.send(session.time().await);
            }
            Request::SyncTime { time, reply } => {
                let _ = reply.send(session.sync_time(time).await);
            }
            Request::List(reply) => {
                let _ = reply.send(session.ls().await);
            }
            Request::FileSize { name, reply } => {
                let _ = reply.send(session.file_size(&name).await);
            }
            Request::FileCrc { name, reply } => {
                let _ = reply.send(session.file_crc(&name).await);
            }
            Request::Delete { name, reply } => {
                let _ = reply.send(session.delete(&name).await);
            }
            Request::Format(reply) => {
                let _ = reply.send(session.format().await);
            }
            Request::Run(reply) => {
                let _ = reply.send(session.run().await);
            }
            Request::RunWithString { label, reply } => {
                let _ = reply.send(session.run_with_string(&label).await);
            }
            Request::Stop(reply) => {
                let _ = reply.send(session.stop().await);
            }
            Request::StopWithString { label, reply } => {
                let _ = reply.send(session.stop_with_string(&label).await);
            }
            Request::Download {
                name,
                size,
                verify,
                cancel,
                reply,
            } => {
                let result = if verify {
                    session.download_verified(&name, size, &cancel).await
                } else {
                    session.download(&name, size, &cancel).await
                };
                let _ = reply.send(result);
            }
            Request::Close(reply) => {
                let _ = reply.send(session.close().await);
            }
        }
    }
}

/// Cloneable front end of a spawned session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    requests: mpsc::Sender<Request>,
}

/// Move `session` into a task serving requests until it is closed or every
/// handle is dropped.
pub fn spawn(session: Session) -> SessionHandle {
    let (requests, inbox) = mpsc::channel(REQUEST_QUEUE_DEPTH);
    tokio::spawn(serve(session, inbox));
    SessionHandle { requests }
}

async fn serve(mut session: Session, mut inbox: mpsc::Receiver<Request>) {
    while let Some(request) = inbox.recv().await {
        let closing = matches!(request, Request::Close(_));
        request.serve(&mut session).await;
        if closing {
            break;
        }
    }
    if !session.is_closed() {
        if let Err(e) = session.close().await {
            debug!(error = %e, "disconnect after last handle dropped failed");
        }
    }
    debug!(address = session.address(), "session task finished");
}

impl SessionHandle {
    async fn call<T>(
        &self,
        request: impl FnOnce(Responder<T>) -> Request,
    ) -> Result<T, EngineError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(request(reply))
            .await
            .map_err(|_| EngineError::SessionClosed)?;
        response.await.map_err(|_| EngineError::SessionClosed)?
    }

    /// Whether the session task has ended.
    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }

    pub async fn command(
        &self,
        command: &str,
        argument: Option<&str>,
    ) -> Result<Answer, EngineError> {
        self.call(|reply| Request::Command {
            command: command.to_string(),
            argument: argument.map(str::to_string),
            reply,
        })
        .await
    }

    pub async fn status(&self) -> Result<LoggerStatus, EngineError> {
        self.call(Request::Status).await
    }

    pub async fn firmware_version(&self) -> Result<String, EngineError> {
        self.call(Request::FirmwareVersion).await
    }

    pub async fn battery_mv(&self) -> Result<u16, EngineError> {
        self.call(Request::BatteryMv).await
    }

    pub async fn time(&self) -> Result<NaiveDateTime, EngineError> {
        self.call(Request::Time).await
    }

    pub async fn sync_time(&self, time: NaiveDateTime) -> Result<(), EngineError> {
        self.call(|reply| Request::SyncTime { time, reply }).await
    }

    pub async fn ls(&self) -> Result<Vec<FileEntry>, EngineError> {
        self.call(Request::List).await
    }

    pub async fn file_size(&self, name: &str) -> Result<u64, EngineError> {
        self.call(|reply| Request::FileSize {
            name: name.to_string(),
            reply,
        })
        .await
    }

    pub async fn file_crc(&self, name: &str) -> Result<u32, EngineError> {
        self.call(|reply| Request::FileCrc {
            name: name.to_string(),
            reply,
        })
        .await
    }

    pub async fn delete(&self, name: &str) -> Result<(), EngineError> {
        self.call(|reply| Request::Delete {
            name: name.to_string(),
            reply,
        })
        .await
    }

    pub async fn format(&self) -> Result<(), EngineError> {
        self.call(Request::Format).await
    }

    pub async fn run(&self) -> Result<(), EngineError> {
        self.call(Request::Run).await
    }

    pub async fn run_with_string(&self, label: &str) -> Result<(), EngineError> {
        self.call(|reply| Request::RunWithString {
            label: label.to_string(),
            reply,
        })
        .await
    }

    pub async fn stop(&self) -> Result<(), EngineError> {
        self.call(Request::Stop).await
    }

    pub async fn stop_with_string(&self, label: &str) -> Result<(), EngineError> {
        self.call(|reply| Request::StopWithString {
            label: label.to_string(),
            reply,
        })
        .await
    }

    pub async fn download(
        &self,
        name: &str,
        size: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, EngineError> {
        self.call(|reply| Request::Download {
            name: name.to_string(),
            size,
            verify: false,
            cancel: cancel.clone(),
            reply,
        })
        .await
    }

    pub async fn download_verified(
        &self,
        name: &str,
        size: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, EngineError> {
        self.call(|reply| Request::Download {
            name: name.to_string(),
            size,
            verify: true,
            cancel: cancel.clone(),
            reply,
        })
        .await
    }

    pub async fn close(&self) -> Result<(), EngineError> {
        self.call(Request::Close).await
    }
}
