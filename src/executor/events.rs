//! Execution output events and the stream that carries them.
//!
//! The agent writes one JSON object per line. Lines that fail to parse are
//! surfaced as warnings rather than aborting the execution. Every
//! [`ExecutionStream`] ends with exactly one [`ExecutionEvent::Exit`].

use std::pin::Pin;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;

use super::SandboxError;

/// Terminal status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitState {
    /// The agent finished normally.
    Ok,
    /// The execution failed.
    Error,
}

/// One event on the execution output channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// Incremental assistant text.
    #[serde(rename = "text")]
    TextDelta {
        /// Text fragment.
        content: String,
    },
    /// The agent invoked a tool.
    ToolUse {
        /// Tool name.
        name: String,
        /// Tool input.
        input: Value,
    },
    /// A tool returned.
    ToolResult {
        /// Tool name.
        name: String,
        /// Tool output.
        output: Value,
    },
    /// Non-fatal condition worth showing the user.
    Warning {
        /// Short title.
        title: String,
        /// Details.
        message: String,
    },
    /// Classified failure.
    TypedError {
        /// Stable error code.
        code: String,
        /// Short title.
        title: String,
        /// Details.
        message: String,
    },
    /// End of the execution.
    Exit {
        /// Success or failure.
        status: ExitState,
        /// Human-readable reason.
        reason: Option<String>,
    },
}

impl ExecutionEvent {
    /// Successful exit.
    pub fn exit_ok() -> Self {
        Self::Exit {
            status: ExitState::Ok,
            reason: None,
        }
    }

    /// Failed exit with a reason.
    pub fn exit_error(reason: impl Into<String>) -> Self {
        Self::Exit {
            status: ExitState::Error,
            reason: Some(reason.into()),
        }
    }

    /// Typed error event for an engine error.
    pub fn typed_error(error: &SandboxError, message: impl Into<String>) -> Self {
        Self::TypedError {
            code: error.code().to_owned(),
            title: error.title().to_owned(),
            message: message.into(),
        }
    }

    /// Whether this is the terminal event.
    pub fn is_exit(&self) -> bool {
        matches!(self, Self::Exit { .. })
    }
}

/// Parse one output line.
///
/// Returns `None` for blank lines. Malformed lines become a
/// [`ExecutionEvent::Warning`] quoting a prefix of the line.
pub fn parse_line(line: &str) -> Option<ExecutionEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<ExecutionEvent>(trimmed) {
        Ok(event) => Some(event),
        Err(e) => {
            let preview: String = trimmed.chars().take(200).collect();
            Some(ExecutionEvent::Warning {
                title: "Unrecognised agent output".to_owned(),
                message: format!("{e}: {preview}"),
            })
        }
    }
}

/// Exit reason when the producer vanished without reporting one.
pub const TRANSPORT_CLOSED: &str = "execution transport closed before the agent reported completion";

/// Lazy, finite sequence of events for one execution.
///
/// Dropping the stream cancels the execution: the producer notices the
/// closed channel and terminates the agent process. If the producer goes
/// away without sending an exit, the stream ends with a failed one.
#[derive(Debug)]
pub struct ExecutionStream {
    session_id: String,
    inner: ReceiverStream<ExecutionEvent>,
    exited: bool,
}

impl ExecutionStream {
    /// Wrap the receiving half of an event channel.
    pub fn new(session_id: impl Into<String>, rx: mpsc::Receiver<ExecutionEvent>) -> Self {
        Self {
            session_id: session_id.into(),
            inner: ReceiverStream::new(rx),
            exited: false,
        }
    }

    /// Stream that yields a single typed error followed by a failed exit.
    pub fn failed(session_id: impl Into<String>, error: &SandboxError) -> Self {
        let (tx, rx) = mpsc::channel(2);
        let message = error.to_string();
        // Capacity covers both sends.
        let _ = tx.try_send(ExecutionEvent::typed_error(error, message.clone()));
        let _ = tx.try_send(ExecutionEvent::exit_error(message));
        Self::new(session_id, rx)
    }

    /// Session this stream belongs to.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Drain the stream into a vector.
    pub async fn collect_all(mut self) -> Vec<ExecutionEvent> {
        use tokio_stream::StreamExt;

        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}

impl Stream for ExecutionStream {
    type Item = ExecutionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.exited {
            return Poll::Ready(None);
        }
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(event)) => {
                self.exited = event.is_exit();
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                self.exited = true;
                Poll::Ready(Some(ExecutionEvent::exit_error(TRANSPORT_CLOSED)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
