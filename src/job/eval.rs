//! Broadcast job: one command evaluated on every worker at once.

use serde::Serialize;

use crate::job::id::JobId;
use crate::job::sink::TextSink;
use crate::job::state::EvalStatus;

/// A command string run on all workers. Lives only for the duration of one `eval` call.
#[derive(Debug, Default)]
pub struct EvalJob {
    id: JobId,
    command: String,
    status: EvalStatus,
    output: TextSink,
    error: TextSink,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvalReport {
    pub id: JobId,
    pub command: String,
    pub status: EvalStatus,
    pub output: String,
    pub error: String,
}

impl EvalJob {
    pub fn new(command: impl Into<String>) -> Self {
        Self::with_id(JobId::next(), command)
    }

    pub fn with_id(id: JobId, command: impl Into<String>) -> Self {
        Self {
            id,
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn status(&self) -> EvalStatus {
        self.status
    }

    pub fn output(&self) -> &TextSink {
        &self.output
    }

    pub fn error(&self) -> &TextSink {
        &self.error
    }

    /// Append one worker's captured output under a banner. Nothing is written for empty text.
    pub fn add_output(&mut self, worker: usize, text: &str) {
        if self.status == EvalStatus::NoJob {
            self.status = EvalStatus::Success;
        }
        if text.is_empty() {
            return;
        }
        self.output.append_line(&format!(
            "==== output: worker {worker}, job {} ====",
            self.id
        ));
        append_block(&self.output, text);
    }

    /// Append one worker's error text and mark the whole job as failed.
    pub fn add_error(&mut self, worker: usize, text: &str) {
        self.status = EvalStatus::Error;
        if text.is_empty() {
            self.error
                .append_line(&format!("error: worker {worker}, job {}", self.id));
            return;
        }
        self.error.append_line(&format!(
            "==== error: worker {worker}, job {} ====",
            self.id
        ));
        append_block(&self.error, text);
    }

    pub fn report(&self) -> EvalReport {
        EvalReport {
            id: self.id,
            command: self.command.clone(),
            status: self.status,
            output: self.output.contents(),
            error: self.error.contents(),
        }
    }
}

fn append_block(sink: &TextSink, text: &str) {
    if text.ends_with('\n') {
        sink.append(text);
    } else {
        sink.append_line(text);
    }
}
