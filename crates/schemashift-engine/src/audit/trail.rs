use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use schemashift_core::audit::{AuditDetail, AuditEntry};
use schemashift_core::traits::{AuditSink, Clock, SystemClock};
use schemashift_core::types::AuditOutcome;
use sha2::{Digest, Sha256};

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Append-only, in-memory audit trail shared by every pipeline component.
///
/// Entries are numbered from 0 and never reordered or removed. When a sink is
/// attached every entry is also forwarded to it; sink failures do not stop the
/// run and are collected for the caller to report.
pub struct AuditTrailRecorder {
    actor: String,
    entries: Vec<AuditEntry>,
    sink: Option<Box<dyn AuditSink>>,
    sink_errors: Vec<String>,
    clock: Arc<dyn Clock>,
}

impl AuditTrailRecorder {
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            entries: Vec::new(),
            sink: None,
            sink_errors: Vec::new(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn AuditSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn record(
        &mut self,
        correlation_id: &str,
        event: &str,
        target: &str,
        outcome: AuditOutcome,
        detail: AuditDetail,
    ) -> u64 {
        let seq = self.entries.len() as u64;
        let entry = AuditEntry {
            seq,
            ts: self.clock.now(),
            event: event.to_string(),
            actor: self.actor.clone(),
            target: target.to_string(),
            outcome,
            detail,
            correlation_id: correlation_id.to_string(),
        };
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.append(&entry) {
                tracing::warn!(seq, event, error = %e, "audit sink rejected entry");
                self.sink_errors.push(format!("audit entry {seq} ({event}): {e}"));
            }
        }
        self.entries.push(entry);
        seq
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    /// Entries from `seq` onwards.
    pub fn since(&self, seq: u64) -> &[AuditEntry] {
        let start = (seq as usize).min(self.entries.len());
        &self.entries[start..]
    }

    pub fn next_seq(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Drain sink failures collected since the last call.
    pub fn take_sink_errors(&mut self) -> Vec<String> {
        std::mem::take(&mut self.sink_errors)
    }
}

/// A single run's view of the recorder, stamping every entry with the same
/// correlation id.
pub struct RunLog<'a> {
    recorder: &'a mut AuditTrailRecorder,
    correlation_id: String,
    first_seq: u64,
}

impl<'a> RunLog<'a> {
    pub fn begin(recorder: &'a mut AuditTrailRecorder, prefix: &str) -> Self {
        let correlation_id = correlation_id(prefix, recorder.clock.as_ref());
        let first_seq = recorder.next_seq();
        Self {
            recorder,
            correlation_id,
            first_seq,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn success(&mut self, event: &str, target: &str, detail: AuditDetail) {
        self.record(event, target, AuditOutcome::Success, detail);
    }

    pub fn failure(&mut self, event: &str, target: &str, detail: AuditDetail) {
        self.record(event, target, AuditOutcome::Failure, detail);
    }

    pub fn record(&mut self, event: &str, target: &str, outcome: AuditOutcome, detail: AuditDetail) {
        let correlation_id = self.correlation_id.clone();
        self.recorder
            .record(&correlation_id, event, target, outcome, detail);
    }

    /// Entries written by this run so far.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.recorder.since(self.first_seq).to_vec()
    }

    pub fn take_sink_errors(&mut self) -> Vec<String> {
        self.recorder.take_sink_errors()
    }
}

fn correlation_id(prefix: &str, clock: &dyn Clock) -> String {
    let n = RUN_COUNTER.fetch_add(1, Ordering::Relaxed);
    let seed = format!(
        "{}:{}:{}",
        clock.now().timestamp_nanos_opt().unwrap_or_default(),
        std::process::id(),
        n
    );
    let digest = format!("{:x}", Sha256::digest(seed.as_bytes()));
    format!("{prefix}-{}", &digest[..16])
}
