//! The forked child.
//!
//! Everything here runs between `fork` and the jump into the entry stub of a
//! process that may have been forked from a multithreaded parent: no heap
//! allocation, no logging, no locks. Failures are published through the
//! status words of the aux page and end in `_exit`.

use crate::arena::{ArenaLayout, AuxPage};
use crate::counter::{self, CounterBinding};
use crate::injector::{CodeRegion, InjectError};
use nix::errno::Errno;
use nix::sys::ptrace;
use std::mem;
use std::os::fd::RawFd;
use std::ptr;

/// Setup progress the subject publishes in `AuxPage::status`.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectStatus {
    Pending = 0,
    Ready = 1,
    TraceRequest = 2,
    AuxMapping = 3,
    CodeMapping = 4,
    CodePlacement = 5,
    CodeProtection = 6,
    CounterResolution = 7,
    CounterOpen = 8,
    /// Set by the generated code when a counter ioctl or read fails.
    CounterControl = 9,
    StackMapping = 10,
}

impl SubjectStatus {
    pub fn from_raw(raw: u64) -> Option<Self> {
        Some(match raw {
            0 => SubjectStatus::Pending,
            1 => SubjectStatus::Ready,
            2 => SubjectStatus::TraceRequest,
            3 => SubjectStatus::AuxMapping,
            4 => SubjectStatus::CodeMapping,
            5 => SubjectStatus::CodePlacement,
            6 => SubjectStatus::CodeProtection,
            7 => SubjectStatus::CounterResolution,
            8 => SubjectStatus::CounterOpen,
            9 => SubjectStatus::CounterControl,
            10 => SubjectStatus::StackMapping,
            _ => return None,
        })
    }

    /// Human-readable name of the failed setup step.
    pub fn stage(self) -> &'static str {
        match self {
            SubjectStatus::Pending => "startup",
            SubjectStatus::Ready => "ready",
            SubjectStatus::TraceRequest => "trace request",
            SubjectStatus::AuxMapping => "aux mapping",
            SubjectStatus::CodeMapping => "code mapping",
            SubjectStatus::CodePlacement => "code placement",
            SubjectStatus::CodeProtection => "code protection",
            SubjectStatus::CounterResolution => "counter resolution",
            SubjectStatus::CounterOpen => "counter open",
            SubjectStatus::CounterControl => "counter control",
            SubjectStatus::StackMapping => "stack mapping",
        }
    }
}

/// Everything the child needs, prepared by the controller before `fork`.
pub struct SubjectPlan<'a> {
    pub layout: ArenaLayout,
    pub arena_fd: RawFd,
    /// The controller's aux view, inherited across `fork`.
    pub aux: *mut AuxPage,
    pub region: CodeRegion<'a>,
    pub entry_offset: usize,
    pub event: &'a str,
    pub iterations: u64,
    pub pin_to_core: Option<usize>,
}

macro_rules! aux_write {
    ($aux:expr, $field:ident, $value:expr) => {
        // SAFETY: `aux` is the page-sized shared view mapped by the controller.
        unsafe { ptr::addr_of_mut!((*$aux).$field).write_volatile($value) }
    };
}

fn fail(aux: *mut AuxPage, status: SubjectStatus, errno: i32) -> ! {
    aux_write!(aux, status_errno, errno as i64);
    aux_write!(aux, status, status as u64);
    unsafe { libc::_exit(1) }
}

/// Pins the calling process to `core_id`.
pub fn pin_to_core(core_id: usize) -> Result<(), Errno> {
    if core_id >= libc::CPU_SETSIZE as usize {
        return Err(Errno::EINVAL);
    }
    unsafe {
        let mut cpuset: libc::cpu_set_t = mem::zeroed();
        libc::CPU_SET(core_id, &mut cpuset);
        // 0 means the calling thread
        Errno::result(libc::sched_setaffinity(
            0,
            mem::size_of::<libc::cpu_set_t>(),
            &cpuset,
        ))
        .map(drop)
    }
}

/// Maps one read-write page of the arena at a fixed subject address.
fn map_page(layout: &ArenaLayout, arena_fd: RawFd, addr: u64, offset: u64) -> Result<(), Errno> {
    let len = layout.page_size as usize;
    let mapped = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED_NOREPLACE,
            arena_fd,
            offset as libc::off_t,
        )
    };
    if mapped == libc::MAP_FAILED {
        return Err(Errno::last());
    }
    if mapped as u64 != addr {
        unsafe { libc::munmap(mapped, len) };
        return Err(Errno::EEXIST);
    }
    Ok(())
}

/// Bootstraps the subject and enters the entry stub, which stops the
/// process with `SIGSTOP` before any measured code runs.
pub fn run(plan: &SubjectPlan<'_>) -> ! {
    let aux = plan.aux;

    if let Err(e) = ptrace::traceme() {
        fail(aux, SubjectStatus::TraceRequest, e as i32);
    }

    let layout = &plan.layout;
    if let Err(e) = map_page(layout, plan.arena_fd, layout.aux_addr, layout.aux_offset) {
        fail(aux, SubjectStatus::AuxMapping, e as i32);
    }
    if let Err(e) = map_page(layout, plan.arena_fd, layout.stack_addr, layout.stack_offset) {
        fail(aux, SubjectStatus::StackMapping, e as i32);
    }

    match plan.region.inject(&plan.layout, plan.arena_fd) {
        Ok(()) => {}
        Err(InjectError::Map(e)) => fail(aux, SubjectStatus::CodeMapping, e as i32),
        Err(InjectError::Placement(_)) => {
            fail(aux, SubjectStatus::CodePlacement, libc::E2BIG)
        }
        Err(InjectError::Protect(e)) => fail(aux, SubjectStatus::CodeProtection, e as i32),
    }

    let event = match counter::resolve(plan.event) {
        Ok(event) => event,
        Err(_) => fail(aux, SubjectStatus::CounterResolution, libc::EINVAL),
    };
    let perf_fd = match CounterBinding::open(event) {
        Ok(binding) => binding.into_raw_fd(),
        Err(e) => fail(aux, SubjectStatus::CounterOpen, e as i32),
    };
    aux_write!(aux, perf_fd, perf_fd as i64);

    // best effort; the controller reports a failure
    if let Some(core) = plan.pin_to_core {
        let errno = match pin_to_core(core) {
            Ok(()) => 0,
            Err(e) => e as i64,
        };
        aux_write!(aux, pin_errno, errno);
    }
    unsafe {
        libc::setpriority(libc::PRIO_PROCESS, 0, 0);
    }

    aux_write!(aux, iterations, plan.iterations);
    aux_write!(aux, remaining, plan.iterations);
    aux_write!(aux, test_page_end, plan.layout.code_end());
    aux_write!(aux, status, SubjectStatus::Ready as u64);

    let entry = plan.layout.code_addr as usize + plan.entry_offset;
    // SAFETY: `entry` points into the execute-only window injected above.
    let entry: extern "C" fn() -> ! = unsafe { mem::transmute::<usize, extern "C" fn() -> !>(entry) };
    entry()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_and_stages() {
        for raw in 0..=10 {
            let status = SubjectStatus::from_raw(raw).unwrap();
            assert_eq!(status as u64, raw);
        }
        assert_eq!(SubjectStatus::from_raw(11), None);
        assert_eq!(SubjectStatus::CounterControl.stage(), "counter control");
        assert_eq!(SubjectStatus::TraceRequest.stage(), "trace request");
        assert_eq!(SubjectStatus::CounterResolution.stage(), "counter resolution");
    }

    #[test]
    fn test_pin_rejects_out_of_range_core() {
        assert_eq!(pin_to_core(libc::CPU_SETSIZE as usize), Err(Errno::EINVAL));
    }
}
