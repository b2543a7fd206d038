//! Hardware performance counter binding.
//!
//! Resolution and opening run inside the freshly forked subject, so nothing
//! on those paths allocates: names are matched byte by byte and errors are
//! plain `Copy` values.

use crate::arena::CounterReading;
use crate::error::{HarnessError, Result};
use libc::{c_ulong, c_void};
use nix::errno::Errno;
use perf_event_open_sys::bindings as perf;
use perf_event_open_sys::ioctls;
use std::fmt;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

// _IO('$', n), as immediates for the generated code. Rust-side callers go
// through `perf_event_open_sys::ioctls`.
pub const PERF_EVENT_IOC_ENABLE: i32 = 0x2400;
pub const PERF_EVENT_IOC_DISABLE: i32 = 0x2401;
pub const PERF_EVENT_IOC_RESET: i32 = 0x2403;

/// Bytes `read(2)` returns for the read format [`attr`] requests.
pub const COUNTER_READ_SIZE: usize = mem::size_of::<CounterReading>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterEvent {
    pub type_: u32,
    pub config: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterError {
    EmptyName,
    UnknownEvent,
    /// Anything but `:u`; only user-mode counting is supported
    UnsupportedModifier,
    InvalidRawEncoding,
}

impl fmt::Display for CounterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CounterError::EmptyName => write!(f, "empty event name"),
            CounterError::UnknownEvent => write!(f, "unknown event"),
            CounterError::UnsupportedModifier => {
                write!(f, "unsupported modifier (only :u is accepted)")
            }
            CounterError::InvalidRawEncoding => write!(f, "invalid raw event encoding"),
        }
    }
}

impl std::error::Error for CounterError {}

// Canonical spellings with separators removed.
const EVENTS: &[(&str, u32, u64)] = &[
    ("cycles", perf::PERF_TYPE_HARDWARE as u32, perf::PERF_COUNT_HW_CPU_CYCLES as u64),
    ("cpucycles", perf::PERF_TYPE_HARDWARE as u32, perf::PERF_COUNT_HW_CPU_CYCLES as u64),
    ("corecycles", perf::PERF_TYPE_HARDWARE as u32, perf::PERF_COUNT_HW_CPU_CYCLES as u64),
    ("instructions", perf::PERF_TYPE_HARDWARE as u32, perf::PERF_COUNT_HW_INSTRUCTIONS as u64),
    ("refcycles", perf::PERF_TYPE_HARDWARE as u32, perf::PERF_COUNT_HW_REF_CPU_CYCLES as u64),
    ("branches", perf::PERF_TYPE_HARDWARE as u32, perf::PERF_COUNT_HW_BRANCH_INSTRUCTIONS as u64),
    ("branchinstructions", perf::PERF_TYPE_HARDWARE as u32, perf::PERF_COUNT_HW_BRANCH_INSTRUCTIONS as u64),
    ("branchmisses", perf::PERF_TYPE_HARDWARE as u32, perf::PERF_COUNT_HW_BRANCH_MISSES as u64),
    ("cachereferences", perf::PERF_TYPE_HARDWARE as u32, perf::PERF_COUNT_HW_CACHE_REFERENCES as u64),
    ("cachemisses", perf::PERF_TYPE_HARDWARE as u32, perf::PERF_COUNT_HW_CACHE_MISSES as u64),
    ("buscycles", perf::PERF_TYPE_HARDWARE as u32, perf::PERF_COUNT_HW_BUS_CYCLES as u64),
    ("stalledcyclesfrontend", perf::PERF_TYPE_HARDWARE as u32, perf::PERF_COUNT_HW_STALLED_CYCLES_FRONTEND as u64),
    ("stalledcyclesbackend", perf::PERF_TYPE_HARDWARE as u32, perf::PERF_COUNT_HW_STALLED_CYCLES_BACKEND as u64),
    ("taskclock", perf::PERF_TYPE_SOFTWARE as u32, perf::PERF_COUNT_SW_TASK_CLOCK as u64),
    ("pagefaults", perf::PERF_TYPE_SOFTWARE as u32, perf::PERF_COUNT_SW_PAGE_FAULTS as u64),
];

fn is_separator(b: u8) -> bool {
    matches!(b, b' ' | b'_' | b'-')
}

/// Compares `input` with `canonical`, ignoring case and separators in `input`.
fn matches_canonical(input: &[u8], canonical: &str) -> bool {
    let mut expected = canonical.bytes();
    for b in input.iter().copied().filter(|b| !is_separator(*b)) {
        match expected.next() {
            Some(c) if c == b.to_ascii_lowercase() => {}
            _ => return false,
        }
    }
    expected.next().is_none()
}

fn parse_raw(input: &[u8]) -> std::result::Result<u64, CounterError> {
    let digits = match input.split_first() {
        Some((b'r' | b'R', rest)) if !rest.is_empty() && rest.len() <= 16 => rest,
        _ => return Err(CounterError::InvalidRawEncoding),
    };
    let mut value = 0u64;
    for &b in digits {
        let nibble = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return Err(CounterError::InvalidRawEncoding),
        };
        value = (value << 4) | nibble as u64;
    }
    Ok(value)
}

/// Resolves a symbolic event name such as `cycles`, `Core Cycles`,
/// `branch_misses:u` or a raw `r01c2`.
pub fn resolve(name: &str) -> std::result::Result<CounterEvent, CounterError> {
    let bytes = name.trim().as_bytes();
    let (base, modifier) = match bytes.iter().position(|&b| b == b':') {
        Some(i) => (&bytes[..i], Some(&bytes[i + 1..])),
        None => (bytes, None),
    };
    if let Some(modifier) = modifier {
        if !modifier.eq_ignore_ascii_case(b"u") {
            return Err(CounterError::UnsupportedModifier);
        }
    }
    if base.iter().all(|&b| is_separator(b)) {
        return Err(CounterError::EmptyName);
    }

    for &(canonical, type_, config) in EVENTS {
        if matches_canonical(base, canonical) {
            return Ok(CounterEvent { type_, config });
        }
    }

    if matches!(base.first(), Some(b'r' | b'R')) {
        return parse_raw(base).map(|config| CounterEvent {
            type_: perf::PERF_TYPE_RAW as u32,
            config,
        });
    }
    Err(CounterError::UnknownEvent)
}

/// User-mode only, created disabled, reporting enabled and running time.
pub fn attr(event: CounterEvent) -> perf::perf_event_attr {
    let mut attr = perf::perf_event_attr::default();
    attr.size = mem::size_of_val(&attr) as u32;
    attr.type_ = event.type_;
    attr.config = event.config;
    attr.read_format = (perf::PERF_FORMAT_TOTAL_TIME_ENABLED
        | perf::PERF_FORMAT_TOTAL_TIME_RUNNING) as u64;
    attr.set_disabled(1); // the stub enables it
    attr.set_exclude_kernel(1);
    attr.set_exclude_hv(1);
    attr
}

/// An open counter for the calling process on any CPU.
#[derive(Debug)]
pub struct CounterBinding {
    fd: OwnedFd,
}

impl CounterBinding {
    pub fn open(event: CounterEvent) -> std::result::Result<Self, Errno> {
        let mut attr = attr(event);
        // this process, any CPU, no group
        let fd = Errno::result(unsafe {
            perf_event_open_sys::perf_event_open(
                &mut attr,
                0,
                -1,
                -1,
                perf::PERF_FLAG_FD_CLOEXEC as c_ulong,
            )
        })?;
        // SAFETY: perf_event_open returned a fresh descriptor we own.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Hands the descriptor over to the generated code, which outlives any
    /// Rust scope in the subject.
    pub fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }

    pub fn reset(&self) -> std::result::Result<(), Errno> {
        Errno::result(unsafe { ioctls::RESET(self.fd.as_raw_fd(), 0) }).and(Ok(()))
    }

    pub fn enable(&self) -> std::result::Result<(), Errno> {
        Errno::result(unsafe { ioctls::ENABLE(self.fd.as_raw_fd(), 0) }).and(Ok(()))
    }

    pub fn disable(&self) -> std::result::Result<(), Errno> {
        Errno::result(unsafe { ioctls::DISABLE(self.fd.as_raw_fd(), 0) }).and(Ok(()))
    }

    pub fn read(&self) -> std::result::Result<CounterReading, Errno> {
        let mut reading = CounterReading::default();
        let n = Errno::result(unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut reading as *mut CounterReading as *mut c_void,
                COUNTER_READ_SIZE,
            )
        })?;
        if n as usize != COUNTER_READ_SIZE {
            return Err(Errno::EIO);
        }
        Ok(reading)
    }
}

fn unavailable(name: &str, errno: Errno) -> HarnessError {
    HarnessError::CounterUnavailable(format!("{}: {:?} ({})", name, errno, errno.desc()))
}

/// Opens `name` in the calling process, counts a trivial region and closes
/// it again. Used to check availability before forking a subject.
pub fn probe(name: &str) -> Result<CounterReading> {
    let event =
        resolve(name).map_err(|e| HarnessError::CounterResolution(format!("{}: {}", name, e)))?;
    let binding = CounterBinding::open(event).map_err(|e| unavailable(name, e))?;
    binding
        .reset()
        .and_then(|_| binding.enable())
        .and_then(|_| binding.disable())
        .map_err(|e| unavailable(name, e))?;
    binding.read().map_err(|e| unavailable(name, e))
}
