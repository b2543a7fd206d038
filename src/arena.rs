use crate::error::{HarnessError, Result};
use serde::Serialize;
use std::ffi::CString;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr::{self, NonNull};

/// Where the subject maps its private windows of the arena.
///
/// Far above a PIE binary's low mappings and far below the mmap area, so a
/// `MAP_FIXED_NOREPLACE` request practically never collides.
pub const SUBJECT_BASE: u64 = 0x3_0000_0000;

/// Page-granular description of the arena, shared by both processes.
///
/// The controller computes it once before `fork`; the subject inherits it and
/// a copy is kept at the head of the aux page for outside inspection.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArenaLayout {
    pub page_size: u64,
    /// File offsets
    pub data_offset: u64,
    pub aux_offset: u64,
    pub stack_offset: u64,
    pub code_offset: u64,
    /// Page-rounded size of the executable window
    pub code_len: u64,
    pub arena_len: u64,
    /// Subject-side virtual addresses
    pub aux_addr: u64,
    pub stack_addr: u64,
    pub code_addr: u64,
}

impl ArenaLayout {
    pub fn new(page_size: u64, code_footprint: u64) -> Result<Self> {
        if page_size == 0 || !page_size.is_power_of_two() {
            return Err(HarnessError::InvalidInput(format!(
                "page size {} is not a power of two",
                page_size
            )));
        }
        if code_footprint == 0 {
            return Err(HarnessError::InvalidInput("empty code footprint".into()));
        }
        if mem::size_of::<AuxPage>() as u64 > page_size {
            return Err(HarnessError::ResourceExhaustion(format!(
                "aux page header ({} bytes) does not fit a {} byte page",
                mem::size_of::<AuxPage>(),
                page_size
            )));
        }

        let code_len = round_up_to_page(code_footprint, page_size).ok_or_else(|| {
            HarnessError::InvalidInput(format!("code footprint {} overflows", code_footprint))
        })?;

        Ok(Self {
            page_size,
            data_offset: 0,
            aux_offset: page_size,
            stack_offset: 2 * page_size,
            code_offset: 3 * page_size,
            code_len,
            arena_len: 3 * page_size + code_len,
            // the stack grows down into unmapped memory and the page above
            // it is an unmapped gap, so an overflow faults instead of
            // landing in aux
            stack_addr: SUBJECT_BASE,
            aux_addr: Self::aux_addr_for(page_size),
            code_addr: SUBJECT_BASE + 3 * page_size,
        })
    }

    /// Subject address of the aux page for a given page size. The code
    /// generator needs it before the footprint, and so the layout, is known.
    pub fn aux_addr_for(page_size: u64) -> u64 {
        SUBJECT_BASE + 2 * page_size
    }

    /// Address the relocated frame pointer is set to.
    pub fn stack_base(&self) -> u64 {
        self.stack_addr + self.page_size / 2
    }

    /// First address past the executable window.
    pub fn code_end(&self) -> u64 {
        self.code_addr + self.code_len
    }

    /// True if `addr` lies in a window the trampoline must never remap.
    pub fn is_protected(&self, addr: u64) -> bool {
        let stack = self.stack_addr..self.stack_addr + self.page_size;
        let aux = self.aux_addr..self.aux_addr + self.page_size;
        let code = self.code_addr..self.code_end();
        stack.contains(&addr) || aux.contains(&addr) || code.contains(&addr)
    }
}

pub fn round_up_to_page(value: u64, page_size: u64) -> Option<u64> {
    let mask = page_size - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

pub fn page_start(addr: u64, page_size: u64) -> u64 {
    addr & !(page_size - 1)
}

pub fn host_page_size() -> u64 {
    // SAFETY: sysconf(_SC_PAGESIZE) has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}

/// The counter block in the layout `read(2)` produces for
/// `PERF_FORMAT_TOTAL_TIME_ENABLED | PERF_FORMAT_TOTAL_TIME_RUNNING`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterReading {
    pub value: u64,
    pub time_enabled: u64,
    pub time_running: u64,
}

impl CounterReading {
    /// The PMU shared the counter with other events for part of the run.
    pub fn is_multiplexed(&self) -> bool {
        self.time_running < self.time_enabled
    }
}

/// Metadata page. The generated stub addresses these fields by their byte
/// offsets, so the layout is `repr(C)` and append-only.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AuxPage {
    pub layout: ArenaLayout,
    pub status: u64,
    pub status_errno: i64,
    pub iterations: u64,
    pub remaining: u64,
    pub perf_fd: i64,
    pub arena_fd: i64,
    pub test_page_end: u64,
    pub saved_sp: u64,
    pub saved_fp: u64,
    pub restarts: u64,
    pub completed: u64,
    pub counter: CounterReading,
    /// 0 once pinned, the errno if pinning failed, -1 if not requested
    pub pin_errno: i64,
}

/// Byte offsets into [`AuxPage`] in the form the assemblers take them.
#[derive(Debug, Clone, Copy)]
pub struct AuxOffsets {
    pub status: i32,
    pub status_errno: i32,
    pub iterations: i32,
    pub remaining: i32,
    pub perf_fd: i32,
    pub arena_fd: i32,
    pub saved_sp: i32,
    pub saved_fp: i32,
    pub restarts: i32,
    pub completed: i32,
    pub counter: i32,
}

impl AuxOffsets {
    pub fn get() -> Self {
        Self {
            status: mem::offset_of!(AuxPage, status) as i32,
            status_errno: mem::offset_of!(AuxPage, status_errno) as i32,
            iterations: mem::offset_of!(AuxPage, iterations) as i32,
            remaining: mem::offset_of!(AuxPage, remaining) as i32,
            perf_fd: mem::offset_of!(AuxPage, perf_fd) as i32,
            arena_fd: mem::offset_of!(AuxPage, arena_fd) as i32,
            saved_sp: mem::offset_of!(AuxPage, saved_sp) as i32,
            saved_fp: mem::offset_of!(AuxPage, saved_fp) as i32,
            restarts: mem::offset_of!(AuxPage, restarts) as i32,
            completed: mem::offset_of!(AuxPage, completed) as i32,
            counter: mem::offset_of!(AuxPage, counter) as i32,
        }
    }
}

/// The shared memory object and the controller's three views of it.
///
/// The backing object is a memfd: it has a name only for `/proc` diagnostics
/// and is never reachable through any filesystem path.
pub struct SharedArena {
    fd: OwnedFd,
    layout: ArenaLayout,
    aux: NonNull<AuxPage>,
    stack: NonNull<u8>,
    code: NonNull<u8>,
}

impl SharedArena {
    pub fn new(layout: ArenaLayout) -> Result<Self> {
        let fd = unsafe {
            // 1. Create an anonymous file in memory
            let name = CString::new("bhive_arena")
                .map_err(|e| HarnessError::ResourceExhaustion(e.to_string()))?;
            let raw = libc::memfd_create(name.as_ptr(), 0);
            if raw < 0 {
                return Err(HarnessError::ResourceExhaustion(format!(
                    "memfd_create failed: {}",
                    std::io::Error::last_os_error()
                )));
            }
            OwnedFd::from_raw_fd(raw)
        };

        // 2. Set the size
        if unsafe { libc::ftruncate(fd.as_raw_fd(), layout.arena_len as libc::off_t) } < 0 {
            return Err(HarnessError::ResourceExhaustion(format!(
                "ftruncate to {} bytes failed: {}",
                layout.arena_len,
                std::io::Error::last_os_error()
            )));
        }

        // 3. Map the controller's views
        let page = layout.page_size as usize;
        let aux = map_view(&fd, page, layout.aux_offset, libc::PROT_READ | libc::PROT_WRITE)?;
        let stack = match map_view(&fd, page, layout.stack_offset, libc::PROT_READ | libc::PROT_WRITE) {
            Ok(stack) => stack,
            Err(e) => {
                unsafe { libc::munmap(aux.as_ptr().cast(), page) };
                return Err(e);
            }
        };
        let code = match map_view(&fd, layout.code_len as usize, layout.code_offset, libc::PROT_READ) {
            Ok(code) => code,
            Err(e) => {
                unsafe {
                    libc::munmap(aux.as_ptr().cast(), page);
                    libc::munmap(stack.as_ptr().cast(), page);
                }
                return Err(e);
            }
        };

        let arena = Self {
            fd,
            layout,
            aux: aux.cast(),
            stack,
            code,
        };
        // SAFETY: the aux view is a fresh, page-sized, writable mapping.
        unsafe {
            ptr::addr_of_mut!((*arena.aux.as_ptr()).layout).write_volatile(layout);
            ptr::addr_of_mut!((*arena.aux.as_ptr()).arena_fd).write_volatile(arena.raw_fd() as i64);
            ptr::addr_of_mut!((*arena.aux.as_ptr()).pin_errno).write_volatile(-1);
        }
        Ok(arena)
    }

    pub fn layout(&self) -> &ArenaLayout {
        &self.layout
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Raw pointer to the controller's aux view. The subject inherits this
    /// mapping across `fork` and reports its setup status through it.
    pub fn aux_ptr(&self) -> *mut AuxPage {
        self.aux.as_ptr()
    }

    pub fn status(&self) -> (u64, i64) {
        unsafe {
            (
                ptr::addr_of!((*self.aux.as_ptr()).status).read_volatile(),
                ptr::addr_of!((*self.aux.as_ptr()).status_errno).read_volatile(),
            )
        }
    }

    pub fn completed(&self) -> bool {
        unsafe { ptr::addr_of!((*self.aux.as_ptr()).completed).read_volatile() != 0 }
    }

    pub fn restarts(&self) -> u64 {
        unsafe { ptr::addr_of!((*self.aux.as_ptr()).restarts).read_volatile() }
    }

    pub fn counter(&self) -> CounterReading {
        unsafe { ptr::addr_of!((*self.aux.as_ptr()).counter).read_volatile() }
    }

    /// `None` when the subject was not asked to pin, otherwise the result of
    /// `sched_setaffinity` as `Ok(())` or the errno.
    pub fn pin_result(&self) -> Option<std::result::Result<(), i32>> {
        match unsafe { ptr::addr_of!((*self.aux.as_ptr()).pin_errno).read_volatile() } {
            -1 => None,
            0 => Some(Ok(())),
            errno => Some(Err(errno as i32)),
        }
    }

    pub fn published_layout(&self) -> ArenaLayout {
        unsafe { ptr::addr_of!((*self.aux.as_ptr()).layout).read_volatile() }
    }

    /// Reads the word at `offset` bytes into the stack page.
    pub fn stack_word(&self, offset: u64) -> Option<libc::c_long> {
        let word = mem::size_of::<libc::c_long>() as u64;
        if offset % word != 0 || offset + word > self.layout.page_size {
            return None;
        }
        // SAFETY: bounds and alignment checked above.
        Some(unsafe {
            self.stack
                .as_ptr()
                .add(offset as usize)
                .cast::<libc::c_long>()
                .read_volatile()
        })
    }

    /// The controller's read-only view of the executable window.
    pub fn code(&self) -> &[u8] {
        // SAFETY: mapped for `code_len` bytes for the lifetime of `self`.
        unsafe { std::slice::from_raw_parts(self.code.as_ptr(), self.layout.code_len as usize) }
    }
}

fn map_view(fd: &OwnedFd, len: usize, offset: u64, prot: libc::c_int) -> Result<NonNull<u8>> {
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            prot,
            libc::MAP_SHARED,
            fd.as_raw_fd(),
            offset as libc::off_t,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(HarnessError::ResourceExhaustion(format!(
            "mmap of arena offset {:#x} failed: {}",
            offset,
            std::io::Error::last_os_error()
        )));
    }
    NonNull::new(addr.cast()).ok_or_else(|| HarnessError::ResourceExhaustion("mmap returned null".into()))
}

impl Drop for SharedArena {
    fn drop(&mut self) {
        let page = self.layout.page_size as usize;
        unsafe {
            libc::munmap(self.aux.as_ptr().cast(), page);
            libc::munmap(self.stack.as_ptr().cast(), page);
            libc::munmap(self.code.as_ptr().cast(), self.layout.code_len as usize);
        }
    }
}
