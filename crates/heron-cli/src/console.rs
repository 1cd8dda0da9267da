//! Terminal progress sink. Everything goes to stderr so stdout carries only
//! the final answer.

use std::io::Write;

use heron_core::ui::{StatusLevel, UiSink};

#[derive(Debug, Clone, Copy)]
pub struct ConsoleSink {
    /// Echo streamed chunks as they arrive.
    stream: bool,
}

impl ConsoleSink {
    pub fn new(stream: bool) -> Self {
        Self { stream }
    }
}

fn level_tag(level: StatusLevel) -> &'static str {
    match level {
        StatusLevel::Info => "..",
        StatusLevel::Success => "ok",
        StatusLevel::Warning => "!!",
        StatusLevel::Error => "XX",
    }
}

impl UiSink for ConsoleSink {
    fn status(&self, message: &str, level: StatusLevel) {
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "[{}] {message}", level_tag(level));
    }

    fn stream_prefix(&self, label: &str) {
        if self.stream {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "\n--- {label} ---");
        }
    }

    fn streaming_chunk(&self, text: &str) {
        if self.stream {
            let mut err = std::io::stderr().lock();
            let _ = err.write_all(text.as_bytes());
            let _ = err.flush();
        }
    }

    fn mark_subtask_complete(&self, subtask_id: &str, success: bool) {
        let mut err = std::io::stderr().lock();
        let mark = if success { "+" } else { "!" };
        let _ = writeln!(err, "\n[{mark}] {subtask_id}");
    }
}
