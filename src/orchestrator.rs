//! Process orchestration.
//!
//! One measurement is one subject process:
//!
//! 1. The controller assembles the runtime code, lays out and creates the
//!    arena, and forks.
//! 2. The subject requests tracing, injects the image, binds its counter and
//!    stops itself inside the entry stub.
//! 3. The controller verifies the image, moves the subject's frame onto the
//!    arena stack page and resumes it, servicing faults until the epilogue
//!    halts the subject with the counter reading in the aux page.
//! 4. The subject is killed and reaped on every path out.

use crate::arch::{CodeGenerator, RegisterFile, Registers};
use crate::arena::{host_page_size, ArenaLayout, SharedArena};
use crate::config::HarnessConfig;
use crate::counter;
use crate::error::{HarnessError, Result};
use crate::events::{EventSink, HarnessEvent, TracingSink};
use crate::injector::{CodeRegion, TestImage};
use crate::recovery::{FaultRecord, FaultRecoveryController};
use crate::relocator;
use crate::subject::{self, SubjectPlan, SubjectStatus};
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of one measurement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Measurement {
    /// Counter value over all iterations of the last clean pass
    pub cycles: u64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub iterations: u64,
    pub unroll_factor: u32,
    pub block_len: usize,
    /// Faults serviced before the clean pass
    pub faults: u32,
    /// Trampoline passes the subject counted; always equal to `faults`
    pub restarts: u64,
    pub relocated_words: u64,
    pub multiplexed: bool,
    /// The CPU the subject ran on, if pinning was requested and succeeded
    pub pinned_core: Option<usize>,
}

/// How a trace-stop or exit is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    Fault(Signal),
    /// `SIGSTOP` with the completion flag set
    Halted,
    UnexpectedStop(Signal),
    Exited(i32),
    Killed(Signal),
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Faulted,
    Done,
    Fatal,
}

pub fn classify_stop(status: &WaitStatus, completed: bool) -> StopKind {
    match *status {
        WaitStatus::Stopped(_, Signal::SIGSEGV) => StopKind::Fault(Signal::SIGSEGV),
        WaitStatus::Stopped(_, Signal::SIGSTOP) if completed => StopKind::Halted,
        WaitStatus::Stopped(_, sig) => StopKind::UnexpectedStop(sig),
        WaitStatus::Exited(_, code) => StopKind::Exited(code),
        WaitStatus::Signaled(_, sig, _) => StopKind::Killed(sig),
        _ => StopKind::Other,
    }
}

impl From<StopKind> for LoopState {
    fn from(kind: StopKind) -> Self {
        match kind {
            StopKind::Fault(_) => LoopState::Faulted,
            StopKind::Halted => LoopState::Done,
            _ => LoopState::Fatal,
        }
    }
}

/// Kills and reaps the subject when dropped.
struct SubjectGuard<'a> {
    pid: Pid,
    sink: &'a dyn EventSink,
}

impl Drop for SubjectGuard<'_> {
    fn drop(&mut self) {
        let _ = signal::kill(self.pid, Signal::SIGKILL);
        loop {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) | Err(_) => break,
                Ok(_) => continue,
            }
        }
        self.sink.emit(&HarnessEvent::SubjectTerminated {
            pid: self.pid.as_raw(),
        });
    }
}

pub struct Harness {
    config: HarnessConfig,
    sink: Arc<dyn EventSink>,
}

impl Harness {
    pub fn new(config: HarnessConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            sink: Arc::new(TracingSink),
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Runs `block` unrolled `unroll_factor` times in a fresh subject and
    /// returns the counter reading.
    pub fn measure(&self, block: &[u8], unroll_factor: u32) -> Result<Measurement> {
        let config = &self.config;
        let sink: &dyn EventSink = self.sink.as_ref();

        let test = TestImage::new(block, unroll_factor, &config.limits)?;
        let page_size = host_page_size();
        let code = CodeGenerator::generate(ArenaLayout::aux_addr_for(page_size), page_size, 0)?;
        let region = CodeRegion::new(&code, &test);
        let footprint = region.footprint()?;
        config.limits.check_code_size(footprint as usize)?;
        let layout = ArenaLayout::new(page_size, footprint)?;
        let arena = SharedArena::new(layout)?;

        let plan = SubjectPlan {
            layout,
            arena_fd: arena.raw_fd(),
            aux: arena.aux_ptr(),
            region,
            entry_offset: code.entry_offset,
            event: &config.event,
            iterations: config.iterations,
            pin_to_core: config.pin_to_core,
        };

        // SAFETY: the child only runs the allocation-free bootstrap and
        // never returns into this frame.
        let pid = match unsafe { fork() }? {
            ForkResult::Child => subject::run(&plan),
            ForkResult::Parent { child } => child,
        };
        let guard = SubjectGuard { pid, sink };
        sink.emit(&HarnessEvent::SubjectSpawned { pid: pid.as_raw() });

        self.await_entry_stop(pid, &arena)?;
        let pinned_core = match (config.pin_to_core, arena.pin_result()) {
            (Some(core), Some(Ok(()))) => Some(core),
            (Some(core), Some(Err(errno))) => {
                sink.emit(&HarnessEvent::PinFailed { core, errno });
                None
            }
            _ => None,
        };
        let regs = Registers::read(pid)?;
        sink.emit(&HarnessEvent::SubjectStopped {
            pid: pid.as_raw(),
            ip: regs.instruction_pointer(),
        });
        if !(layout.code_addr..layout.code_end()).contains(&regs.instruction_pointer()) {
            return Err(HarnessError::ProtocolViolation(format!(
                "subject stopped outside the code window at {:#x}",
                regs.instruction_pointer()
            )));
        }

        region.verify(arena.code(), layout.code_addr)?;
        sink.emit(&HarnessEvent::ImageVerified { bytes: footprint });

        let report = relocator::relocate(pid, &arena, sink)?;
        if report.mismatches > 0 {
            warn!("{} relocated stack words failed verification", report.mismatches);
            if config.strict_relocation {
                return Err(HarnessError::RelocationIntegrity {
                    mismatches: report.mismatches,
                });
            }
        }

        let mut recovery =
            FaultRecoveryController::new(layout, code.trampoline_offset, config.max_faults);
        self.run_loop(pid, &arena, &mut recovery)?;

        let halted = Registers::read(pid)?;
        let restarts = arena.restarts();
        sink.emit(&HarnessEvent::SubjectHalted {
            ip: halted.instruction_pointer(),
            restarts,
        });
        if restarts != recovery.serviced() as u64 {
            return Err(HarnessError::ProtocolViolation(format!(
                "{} faults serviced but the trampoline ran {} times",
                recovery.serviced(),
                restarts
            )));
        }

        let reading = arena.counter();
        sink.emit(&HarnessEvent::CounterRead {
            value: reading.value,
            time_enabled: reading.time_enabled,
            time_running: reading.time_running,
        });
        drop(guard);

        Ok(Measurement {
            cycles: reading.value,
            time_enabled: reading.time_enabled,
            time_running: reading.time_running,
            iterations: config.iterations,
            unroll_factor,
            block_len: block.len(),
            faults: recovery.serviced(),
            restarts,
            relocated_words: report.words,
            multiplexed: reading.is_multiplexed(),
            pinned_core,
        })
    }

    /// Waits for the stop the entry stub raises. An exit before it is
    /// explained by the setup status the subject published.
    fn await_entry_stop(&self, pid: Pid, arena: &SharedArena) -> Result<()> {
        let status = waitpid(pid, None)?;
        let (raw, errno) = arena.status();
        let setup = SubjectStatus::from_raw(raw);
        match status {
            WaitStatus::Stopped(_, Signal::SIGSTOP) if setup == Some(SubjectStatus::Ready) => Ok(()),
            WaitStatus::Exited(_, code) => Err(match setup {
                Some(failed @ SubjectStatus::CounterResolution) => {
                    let reason = counter::resolve(&self.config.event)
                        .err()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| failed.stage().to_string());
                    HarnessError::CounterResolution(format!("{}: {}", self.config.event, reason))
                }
                Some(SubjectStatus::CounterOpen) => HarnessError::CounterUnavailable(format!(
                    "{}: {}",
                    self.config.event,
                    std::io::Error::from_raw_os_error(errno as i32)
                )),
                Some(failed) if failed != SubjectStatus::Ready && failed != SubjectStatus::Pending => {
                    HarnessError::SubjectSetup {
                        stage: failed.stage().to_string(),
                        errno: errno as i32,
                    }
                }
                _ => HarnessError::SubjectTerminated(format!(
                    "subject exited with status {} before stopping",
                    code
                )),
            }),
            WaitStatus::Signaled(_, sig, _) => Err(HarnessError::SubjectTerminated(format!(
                "subject killed by {:?} during setup",
                sig
            ))),
            other => Err(HarnessError::ProtocolViolation(format!(
                "expected SIGSTOP from entry stub, got {:?} (setup status {})",
                other, raw
            ))),
        }
    }

    fn run_loop(
        &self,
        pid: Pid,
        arena: &SharedArena,
        recovery: &mut FaultRecoveryController,
    ) -> Result<()> {
        let sink: &dyn EventSink = self.sink.as_ref();
        let mut state = LoopState::Running;
        let mut attempt = 0u32;

        loop {
            match state {
                LoopState::Running => {
                    ptrace::cont(pid, None)?;
                    let status = waitpid(pid, None)?;
                    let kind = classify_stop(&status, arena.completed());
                    state = LoopState::from(kind);
                    if state == LoopState::Fatal {
                        return Err(fatal_stop(kind, &status, arena.status()));
                    }
                }
                LoopState::Faulted => {
                    let info = ptrace::getsiginfo(pid)?;
                    // SAFETY: SIGSEGV siginfo carries a fault address.
                    let address = unsafe { info.si_addr() } as u64;
                    attempt = attempt.saturating_add(1);
                    let record = FaultRecord {
                        signal: info.si_signo,
                        address,
                        attempt,
                    };
                    debug!("Servicing fault {} at {:#x}", attempt, address);
                    recovery.service(pid, &record, sink)?;
                    state = LoopState::Running;
                }
                LoopState::Done => return Ok(()),
                LoopState::Fatal => {
                    return Err(HarnessError::ProtocolViolation("fatal loop state".into()))
                }
            }
        }
    }
}

/// `published` is the status word pair from the aux page; the generated code
/// sets it before trapping on a counter failure.
fn fatal_stop(kind: StopKind, status: &WaitStatus, published: (u64, i64)) -> HarnessError {
    let (raw, errno) = published;
    if SubjectStatus::from_raw(raw) == Some(SubjectStatus::CounterControl) {
        return HarnessError::CounterControl {
            errno: errno as i32,
        };
    }
    match kind {
        StopKind::UnexpectedStop(sig) => {
            HarnessError::SubjectTerminated(format!("subject stopped by {:?}", sig))
        }
        StopKind::Exited(code) => {
            HarnessError::SubjectTerminated(format!("subject exited with status {}", code))
        }
        StopKind::Killed(sig) => {
            HarnessError::SubjectTerminated(format!("subject killed by {:?}", sig))
        }
        _ => HarnessError::ProtocolViolation(format!("unexpected wait status {:?}", status)),
    }
}

/// Measures `block` with the default configuration and returns the cycle
/// count.
pub fn measure(block: &[u8], unroll_factor: u32) -> Result<u64> {
    Harness::new(HarnessConfig::default())?
        .measure(block, unroll_factor)
        .map(|m| m.cycles)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid() -> Pid {
        Pid::from_raw(4242)
    }

    #[test]
    fn test_classify_fault() {
        let status = WaitStatus::Stopped(pid(), Signal::SIGSEGV);
        assert_eq!(classify_stop(&status, false), StopKind::Fault(Signal::SIGSEGV));
        assert_eq!(LoopState::from(classify_stop(&status, false)), LoopState::Faulted);
    }

    #[test]
    fn test_classify_halt_requires_completion() {
        let status = WaitStatus::Stopped(pid(), Signal::SIGSTOP);
        assert_eq!(classify_stop(&status, true), StopKind::Halted);
        assert_eq!(LoopState::from(StopKind::Halted), LoopState::Done);
        assert_eq!(
            classify_stop(&status, false),
            StopKind::UnexpectedStop(Signal::SIGSTOP)
        );
    }

    #[test]
    fn test_classify_fatal_conditions() {
        let cases = [
            WaitStatus::Stopped(pid(), Signal::SIGILL),
            WaitStatus::Stopped(pid(), Signal::SIGFPE),
            WaitStatus::Exited(pid(), 0),
            WaitStatus::Signaled(pid(), Signal::SIGKILL, false),
            WaitStatus::StillAlive,
        ];
        for status in cases {
            let kind = classify_stop(&status, true);
            assert_eq!(LoopState::from(kind), LoopState::Fatal, "{:?}", status);
        }
    }

    #[test]
    fn test_fatal_stop_messages() {
        let status = WaitStatus::Stopped(pid(), Signal::SIGILL);
        let ready = (SubjectStatus::Ready as u64, 0);
        let err = fatal_stop(classify_stop(&status, false), &status, ready);
        assert!(matches!(err, HarnessError::SubjectTerminated(ref m) if m.contains("SIGILL")));
    }

    #[test]
    fn test_counter_failure_trap_reports_errno() {
        let status = WaitStatus::Stopped(pid(), Signal::SIGILL);
        let published = (SubjectStatus::CounterControl as u64, libc::EBADF as i64);
        let err = fatal_stop(classify_stop(&status, false), &status, published);
        assert_eq!(err, HarnessError::CounterControl { errno: libc::EBADF });
        assert!(!err.is_environmental());
    }

    #[test]
    fn test_invalid_input_fails_before_fork() {
        let harness = Harness::new(HarnessConfig::default()).unwrap();
        assert!(matches!(
            harness.measure(&[0x90], 0),
            Err(HarnessError::InvalidInput(_))
        ));
        assert!(matches!(
            harness.measure(&[], 10),
            Err(HarnessError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_config_validated() {
        let config = HarnessConfig {
            iterations: 0,
            ..Default::default()
        };
        assert!(Harness::new(config).is_err());
    }
}
