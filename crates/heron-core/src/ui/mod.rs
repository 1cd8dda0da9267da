//! Fire-and-forget progress reporting.
//!
//! [`UiSink`] methods are synchronous and must never block the scheduler.
//! Rendering is left to the implementor.

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Receiver of orchestration progress.
pub trait UiSink: Send + Sync {
    fn status(&self, message: &str, level: StatusLevel);

    /// Announce the source of the chunks that follow.
    fn stream_prefix(&self, label: &str);

    fn streaming_chunk(&self, text: &str);

    fn mark_subtask_complete(&self, subtask_id: &str, success: bool);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl UiSink for NullSink {
    fn status(&self, _message: &str, _level: StatusLevel) {}
    fn stream_prefix(&self, _label: &str) {}
    fn streaming_chunk(&self, _text: &str) {}
    fn mark_subtask_complete(&self, _subtask_id: &str, _success: bool) {}
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl UiSink for TracingSink {
    fn status(&self, message: &str, level: StatusLevel) {
        match level {
            StatusLevel::Info | StatusLevel::Success => tracing::info!("{message}"),
            StatusLevel::Warning => tracing::warn!("{message}"),
            StatusLevel::Error => tracing::error!("{message}"),
        }
    }

    fn stream_prefix(&self, label: &str) {
        tracing::debug!(label, "stream started");
    }

    fn streaming_chunk(&self, text: &str) {
        tracing::trace!(len = text.len(), "chunk");
    }

    fn mark_subtask_complete(&self, subtask_id: &str, success: bool) {
        tracing::info!(subtask_id, success, "subtask finished");
    }
}

/// A UI event as delivered by [`ChannelSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    Status { message: String, level: StatusLevel },
    StreamPrefix(String),
    Chunk(String),
    SubtaskComplete { subtask_id: String, success: bool },
}

/// Sends events over an unbounded channel. Never blocks; events sent after
/// the receiver is dropped are discarded.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<UiEvent>) -> Self {
        Self { tx }
    }

    /// A sink and the receiver for its events.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    fn send(&self, event: UiEvent) {
        let _ = self.tx.send(event);
    }
}

impl UiSink for ChannelSink {
    fn status(&self, message: &str, level: StatusLevel) {
        self.send(UiEvent::Status {
            message: message.to_string(),
            level,
        });
    }

    fn stream_prefix(&self, label: &str) {
        self.send(UiEvent::StreamPrefix(label.to_string()));
    }

    fn streaming_chunk(&self, text: &str) {
        self.send(UiEvent::Chunk(text.to_string()));
    }

    fn mark_subtask_complete(&self, subtask_id: &str, success: bool) {
        self.send(UiEvent::SubtaskComplete {
            subtask_id: subtask_id.to_string(),
            success,
        });
    }
}
