//! Service API - the remote operations, independent of any transport
//!
//! Every request maps to exactly one engine call. Results and failures
//! are turned into [`Response`] values so a transport only has to move
//! JSON around.

use crate::core::{OutputReader, QueueRegistry, TaskSpec};
use crate::error::{Error, ErrorKind, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// Client message that asks a stream for its next chunk
pub const STREAM_TOKEN: &str = "c";

/// One remote call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    CreateQueue { name: String },
    DeleteQueue { name: String },
    RenameQueue { old_name: String, new_name: String },
    ListQueues,
    Submit { queue: String, task: TaskSpec },
    ListFinished { queue: String },
    TaskDetails { queue: String, id: u32 },
    ClearFinished { queue: String },
    ListPending { queue: String },
    PendingDetails { queue: String, id: u32 },
    RemovePending { queue: String, id: u32 },
    ClearPending { queue: String },
    CurrentTask { queue: String },
    /// Opens a stream; only meaningful on a streaming transport
    StreamOutput { queue: String },
}

/// A request plus the caller's credential
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    pub request: Request,
}

/// Reply to a request, or one message of an output stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok {
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    Chunk {
        data: String,
    },
    EndOfStream,
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl Response {
    pub fn ok() -> Self {
        Self::Ok { data: None }
    }

    pub fn ok_with_data(data: Value) -> Self {
        Self::Ok { data: Some(data) }
    }

    pub fn chunk(bytes: &[u8]) -> Self {
        Self::Chunk {
            data: String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    pub fn unauthorized() -> Self {
        Self::Error {
            kind: ErrorKind::Unauthorized,
            message: "credential rejected".to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

impl From<Error> for Response {
    fn from(e: Error) -> Self {
        Self::Error {
            kind: e.kind(),
            message: e.reason().to_string(),
        }
    }
}

/// Gate in front of every request
pub trait Interceptor: Send + Sync {
    fn authorize(&self, credential: Option<&str>) -> bool;
}

/// Accepts every caller
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Interceptor for AllowAll {
    fn authorize(&self, _credential: Option<&str>) -> bool {
        true
    }
}

/// Dispatches requests to the registry and its queues
#[derive(Clone)]
pub struct Service {
    registry: Arc<QueueRegistry>,
}

impl Service {
    pub fn new(registry: Arc<QueueRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    pub fn handle(&self, request: Request) -> Response {
        match self.dispatch(request) {
            Ok(Some(data)) => Response::ok_with_data(data),
            Ok(None) => Response::ok(),
            Err(e) => e.into(),
        }
    }

    fn dispatch(&self, request: Request) -> Result<Option<Value>> {
        let reg = &self.registry;
        match request {
            Request::CreateQueue { name } => reg.create(&name).map(|_| None),
            Request::DeleteQueue { name } => reg.remove(&name).map(|_| None),
            Request::RenameQueue { old_name, new_name } => {
                reg.rename(&old_name, &new_name).map(|_| None)
            }
            Request::ListQueues => data(&reg.list()),
            Request::Submit { queue, task } => {
                let id = reg.get(&queue)?.enqueue(task)?;
                Ok(Some(json!({ "id": id })))
            }
            Request::ListFinished { queue } => data(&reg.get(&queue)?.list_finished()),
            Request::TaskDetails { queue, id } => data(&reg.get(&queue)?.finished_details(id)?),
            Request::ClearFinished { queue } => {
                reg.get(&queue)?.clear_finished();
                Ok(None)
            }
            Request::ListPending { queue } => data(&reg.get(&queue)?.list_pending()),
            Request::PendingDetails { queue, id } => {
                data(&reg.get(&queue)?.pending_details(id)?)
            }
            Request::RemovePending { queue, id } => {
                reg.get(&queue)?.remove_pending(id).map(|_| None)
            }
            Request::ClearPending { queue } => {
                reg.get(&queue)?.clear_pending();
                Ok(None)
            }
            Request::CurrentTask { queue } => data(&reg.get(&queue)?.current_task()?),
            Request::StreamOutput { .. } => Err(Error::ValidationFailed(
                "stream_output needs a streaming connection".into(),
            )),
        }
    }

    /// Open a live output stream. The queue is resolved before any reader
    /// is attached.
    pub fn open_stream(&self, queue: &str) -> Result<OutputSession> {
        let reader = self.registry.get(queue)?.current_output_reader()?;
        log::debug!("Stream opened on queue {}", queue);
        Ok(OutputSession {
            queue: queue.to_string(),
            reader,
        })
    }
}

fn data<T: Serialize + ?Sized>(value: &T) -> Result<Option<Value>> {
    Ok(Some(serde_json::to_value(value)?))
}

/// What a follow-up client message means for an open stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamControl {
    Continue,
    Stop,
}

/// Server side of one StreamOutput call
pub struct OutputSession {
    queue: String,
    reader: OutputReader,
}

impl OutputSession {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn on_client_message(&self, message: &str) -> StreamControl {
        if message.trim() == STREAM_TOKEN {
            StreamControl::Continue
        } else {
            log::debug!(
                "Stream on {} stopped by client message {:?}",
                self.queue,
                message
            );
            StreamControl::Stop
        }
    }

    /// Next chunk, or `None` at end of stream
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        self.reader.read().await
    }

    pub fn close(self) {
        log::debug!("Stream on {} closed", self.queue);
        self.reader.detach();
    }
}
