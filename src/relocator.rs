//! Moves the subject's live frame onto the arena stack page.
//!
//! The entry stub stops with a small frame between its stack and frame
//! pointers. That frame is copied word by word, at the same offsets below
//! the frame pointer, to the middle of the stack page; both pointers are then
//! rewritten so the stub continues on the shared page.

use crate::arch::{RegisterFile, Registers, WORD_SIZE};
use crate::arena::{ArenaLayout, SharedArena};
use crate::error::{HarnessError, Result};
use crate::events::{EventSink, HarnessEvent};
use nix::sys::ptrace;
use nix::unistd::Pid;
use serde::Serialize;

/// Where the live frame is and where it goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackSpan {
    pub old_sp: u64,
    pub old_fp: u64,
    pub new_sp: u64,
    pub new_fp: u64,
}

impl StackSpan {
    pub fn new(sp: u64, fp: u64, layout: &ArenaLayout) -> Result<Self> {
        let span = fp.checked_sub(sp).ok_or_else(|| {
            HarnessError::ProtocolViolation(format!(
                "frame pointer {:#x} below stack pointer {:#x}",
                fp, sp
            ))
        })?;
        if span % WORD_SIZE != 0 {
            return Err(HarnessError::ProtocolViolation(format!(
                "stack span {:#x} is not word aligned",
                span
            )));
        }
        if span > layout.page_size / 2 {
            return Err(HarnessError::ProtocolViolation(format!(
                "stack span {:#x} exceeds half a page",
                span
            )));
        }
        let new_fp = layout.stack_base();
        Ok(Self {
            old_sp: sp,
            old_fp: fp,
            new_sp: new_fp - span,
            new_fp,
        })
    }

    pub fn size(&self) -> u64 {
        self.old_fp - self.old_sp
    }

    /// Words copied: from the frame pointer down to, not including, the
    /// stack pointer.
    pub fn words(&self) -> u64 {
        self.size() / WORD_SIZE
    }

    /// Source and destination of the `i`th word below the frame pointer.
    pub fn word(&self, i: u64) -> (u64, u64) {
        (self.old_fp - i * WORD_SIZE, self.new_fp - i * WORD_SIZE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelocationReport {
    pub words: u64,
    pub stack_size: u64,
    pub old_fp: u64,
    pub new_fp: u64,
    pub mismatches: usize,
}

fn peek(pid: Pid, addr: u64) -> Result<libc::c_long> {
    Ok(ptrace::read(pid, addr as ptrace::AddressType)?)
}

/// Copies the stopped subject's frame onto the arena stack page, verifies
/// the copy through both the tracee and the controller's shared view, and
/// rewrites the frame and stack pointers.
///
/// Mismatches are reported to `sink` and counted; deciding whether they are
/// fatal is left to the caller.
pub fn relocate(
    pid: Pid,
    arena: &SharedArena,
    sink: &dyn EventSink,
) -> Result<RelocationReport> {
    let layout = arena.layout();
    let mut regs = Registers::read(pid)?;
    let span = StackSpan::new(regs.stack_pointer(), regs.frame_pointer(), layout)?;

    for i in 0..span.words() {
        let (src, dst) = span.word(i);
        let word = peek(pid, src)?;
        ptrace::write(pid, dst as ptrace::AddressType, word)?;
    }

    let mut mismatches = 0;
    for i in 0..span.words() {
        let (src, dst) = span.word(i);
        let original = peek(pid, src)?;
        let relocated = peek(pid, dst)?;
        let shared = arena
            .stack_word(dst - layout.stack_addr)
            .ok_or_else(|| HarnessError::ProtocolViolation(format!("{:#x} is off the stack page", dst)))?;
        if original != relocated || relocated != shared {
            mismatches += 1;
            sink.emit(&HarnessEvent::RelocationMismatch {
                offset: i * WORD_SIZE,
                original: original as i64,
                relocated: relocated as i64,
                shared: shared as i64,
            });
        }
    }

    regs.set_frame_pointer(span.new_fp);
    regs.set_stack_pointer(span.new_sp);
    regs.write(pid)?;

    sink.emit(&HarnessEvent::StackRelocated {
        words: span.words(),
        old_fp: span.old_fp,
        new_fp: span.new_fp,
        new_sp: span.new_sp,
    });

    Ok(RelocationReport {
        words: span.words(),
        stack_size: span.size(),
        old_fp: span.old_fp,
        new_fp: span.new_fp,
        mismatches,
    })
}
