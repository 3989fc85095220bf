use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::tracer::Tracer;

/// Keeps every trace line, and can cancel a run when a given line is traced.
#[derive(Default)]
pub struct RecordingTracer {
    lines: Mutex<Vec<String>>,
    cancel_on: Option<(String, CancellationToken)>,
}

impl RecordingTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancelling_on(line: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            lines: Mutex::new(Vec::new()),
            cancel_on: Some((line.into(), cancel)),
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

impl Tracer for RecordingTracer {
    fn trace(&self, line: &str) {
        self.lines.lock().push(line.to_string());
        if let Some((trigger, cancel)) = &self.cancel_on {
            if trigger == line {
                cancel.cancel();
            }
        }
    }
}
