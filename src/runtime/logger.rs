/// Per-execution logger
///
/// Every line goes two ways: to `tracing` with the execution id as a field,
/// and into a buffer the executor flushes to the history store at task
/// boundaries. Logging never awaits, so it is usable from sync helpers.

use crate::history::{LogLevel, LogLine};
use chrono::Utc;
use std::sync::{Arc, Mutex};

/// Logger bound to a single execution
#[derive(Debug, Clone)]
pub struct FlowLogger {
    execution_id: Arc<str>,
    flow_id: Arc<str>,
    /// Sequence number of the task this handle was obtained in
    task_seq: Option<u32>,
    buffer: Arc<Mutex<Vec<LogLine>>>,
}

impl FlowLogger {
    pub fn new(execution_id: &str, flow_id: &str) -> Self {
        Self {
            execution_id: Arc::from(execution_id),
            flow_id: Arc::from(flow_id),
            task_seq: None,
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Same sink, lines tagged with a task sequence number
    pub fn for_task(&self, seq: u32) -> Self {
        Self {
            task_seq: Some(seq),
            ..self.clone()
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message.into());
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message.into());
    }

    pub fn log(&self, level: LogLevel, message: String) {
        let execution_id = &*self.execution_id;
        let flow_id = &*self.flow_id;
        match level {
            LogLevel::Debug => tracing::debug!(execution_id, flow_id, task_seq = self.task_seq, "{}", message),
            LogLevel::Info => tracing::info!(execution_id, flow_id, task_seq = self.task_seq, "{}", message),
            LogLevel::Warn => tracing::warn!(execution_id, flow_id, task_seq = self.task_seq, "{}", message),
            LogLevel::Error => tracing::error!(execution_id, flow_id, task_seq = self.task_seq, "{}", message),
        }

        let line = LogLine {
            timestamp: Utc::now(),
            level,
            message,
            task_seq: self.task_seq,
        };
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(line);
    }

    /// Lines logged so far and not yet flushed
    pub fn pending_lines(&self) -> Vec<LogLine> {
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Take buffered lines for persistence
    pub(crate) fn drain(&self) -> Vec<LogLine> {
        std::mem::take(
            &mut *self
                .buffer
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_handles_share_the_buffer() {
        let logger = FlowLogger::new("exec-1", "f1");
        logger.info("flow started");
        logger.for_task(2).warn("slow input");

        let lines = logger.drain();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].task_seq, None);
        assert_eq!(lines[1].task_seq, Some(2));
        assert_eq!(lines[1].level, LogLevel::Warn);
        assert!(lines[1].format().ends_with(" - WARN - slow input"));
        assert!(logger.pending_lines().is_empty());
    }
}
