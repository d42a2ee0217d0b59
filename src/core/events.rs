use crate::core::aggregator::ErrorCategory;
use crate::core::error::TrackerError;
use crate::core::model::{DonePayload, FullResults, ModuleStatus, ResultChunk, ServerError, StatusUpdate, TaskView};
use serde::de::DeserializeOwned;

/// Module name given to crawler results that arrive without one.
pub const CRAWLER_MODULE: &str = "katana";

/// One decoded server-push event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Status(StatusUpdate),
    ModuleStatus(ModuleStatus),
    Result(ResultChunk),
    FullResults(FullResults),
    Done(DonePayload),
    Error(ServerError),
}

impl StreamEvent {
    /// Decodes a named event. Unknown names and bad payloads are protocol errors.
    pub fn decode(event: &str, data: &str) -> Result<Self, TrackerError> {
        let ev = match event {
            "status" => Self::Status(payload(event, data)?),
            "module-status" => Self::ModuleStatus(payload(event, data)?),
            "result" => Self::Result(payload(event, data)?),
            "katana-result" => {
                let mut chunk: ResultChunk = payload(event, data)?;
                if chunk.module.is_empty() {
                    chunk.module = CRAWLER_MODULE.to_string();
                }
                Self::Result(chunk)
            }
            "results" => Self::FullResults(payload(event, data)?),
            "done" => {
                if data.trim().is_empty() {
                    Self::Done(DonePayload::default())
                } else {
                    Self::Done(payload(event, data)?)
                }
            }
            "error" => Self::Error(payload(event, data)?),
            other => return Err(TrackerError::Protocol(format!("unknown event '{}'", other))),
        };
        Ok(ev)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::ModuleStatus(_) => "module-status",
            Self::Result(_) => "result",
            Self::FullResults(_) => "results",
            Self::Done(_) => "done",
            Self::Error(_) => "error",
        }
    }
}

fn payload<T: DeserializeOwned>(event: &str, data: &str) -> Result<T, TrackerError> {
    serde_json::from_str(data).map_err(|e| TrackerError::Protocol(format!("bad '{}' payload: {}", event, e)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Stream,
    Poll,
}

/// What a tracking session publishes to its subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEvent {
    TransportSelected { task_id: String, transport: Transport },
    Updated(TaskView),
    ResultChunk { task_id: String, chunk: ResultChunk },
    ModuleError { task_id: String, module: String, category: ErrorCategory, raw: String },
    ServerError { task_id: String, message: String },
    Results(FullResults),
    Finished(TaskView),
    Failed { task_id: String, message: String },
}
