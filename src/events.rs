//! Diagnostic events.
//!
//! Control flow never depends on a sink: the orchestrator reports what
//! happened and carries on. Sinks are shared with the caller, so they must be
//! `Send + Sync`.

use serde::Serialize;
use std::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HarnessEvent {
    SubjectSpawned { pid: i32 },
    /// First trace-stop, inside the entry stub
    SubjectStopped { pid: i32, ip: u64 },
    ImageVerified { bytes: u64 },
    /// `sched_setaffinity` failed in the subject; the run continues unpinned
    PinFailed { core: usize, errno: i32 },
    StackRelocated { words: u64, old_fp: u64, new_fp: u64, new_sp: u64 },
    RelocationMismatch { offset: u64, original: i64, relocated: i64, shared: i64 },
    FaultIntercepted { signal: i32, address: u64, ip: u64, attempt: u32 },
    FaultRedirected { address: u64, trampoline: u64 },
    SubjectHalted { ip: u64, restarts: u64 },
    CounterRead { value: u64, time_enabled: u64, time_running: u64 },
    SubjectTerminated { pid: i32 },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &HarnessEvent);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &HarnessEvent) {}
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &HarnessEvent) {
        match event {
            HarnessEvent::SubjectSpawned { pid } => info!("Subject spawned (PID {})", pid),
            HarnessEvent::SubjectStopped { pid, ip } => {
                debug!("Subject {} stopped in entry stub at {:#x}", pid, ip)
            }
            HarnessEvent::ImageVerified { bytes } => debug!("Injected image verified ({} bytes)", bytes),
            HarnessEvent::PinFailed { core, errno } => warn!(
                "Could not pin subject to CPU {}: {}; measuring unpinned",
                core,
                std::io::Error::from_raw_os_error(*errno)
            ),
            HarnessEvent::StackRelocated {
                words,
                old_fp,
                new_fp,
                new_sp,
            } => debug!(
                "Relocated {} stack words: fp {:#x} -> {:#x}, sp -> {:#x}",
                words, old_fp, new_fp, new_sp
            ),
            HarnessEvent::RelocationMismatch {
                offset,
                original,
                relocated,
                shared,
            } => warn!(
                "Relocated stack word at -{:#x} differs: original {:#x}, relocated {:#x}, shared {:#x}",
                offset, original, relocated, shared
            ),
            HarnessEvent::FaultIntercepted {
                signal,
                address,
                ip,
                attempt,
            } => debug!(
                "Fault #{} (signal {}) at {:#x}, ip {:#x}",
                attempt, signal, address, ip
            ),
            HarnessEvent::FaultRedirected {
                address,
                trampoline,
            } => debug!("Redirecting fault at {:#x} to trampoline {:#x}", address, trampoline),
            HarnessEvent::SubjectHalted { ip, restarts } => {
                debug!("Subject halted at {:#x} after {} restarts", ip, restarts)
            }
            HarnessEvent::CounterRead {
                value,
                time_enabled,
                time_running,
            } => info!(
                "Counter: {} (enabled {} ns, running {} ns)",
                value, time_enabled, time_running
            ),
            HarnessEvent::SubjectTerminated { pid } => debug!("Subject {} terminated", pid),
        }
    }
}

/// Keeps every event in memory, in order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<HarnessEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<HarnessEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &HarnessEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Records counters and histograms through the `metrics` facade, then
/// forwards to an inner sink.
pub struct MetricsSink<S> {
    inner: S,
}

impl<S: EventSink> MetricsSink<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S: EventSink> EventSink for MetricsSink<S> {
    fn emit(&self, event: &HarnessEvent) {
        match event {
            HarnessEvent::SubjectSpawned { .. } => metrics::counter!("bhive_subjects_spawned", 1),
            HarnessEvent::FaultIntercepted { .. } => metrics::counter!("bhive_faults_intercepted", 1),
            HarnessEvent::PinFailed { .. } => metrics::counter!("bhive_pin_failures", 1),
            HarnessEvent::RelocationMismatch { .. } => {
                metrics::counter!("bhive_relocation_mismatches", 1)
            }
            HarnessEvent::StackRelocated { words, .. } => {
                metrics::histogram!("bhive_relocated_words", *words as f64)
            }
            HarnessEvent::CounterRead { value, .. } => {
                metrics::histogram!("bhive_counter_value", *value as f64)
            }
            _ => {}
        }
        self.inner.emit(event);
    }
}
