//! Hook receiving a readable trace of what a scavenge did.

/// Receives one line per notable step: transaction boundaries,
/// checkpoints and the units of work of each stage.
pub trait Tracer: Send + Sync {
    fn trace(&self, line: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn trace(&self, _line: &str) {}
}
