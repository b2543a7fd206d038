// Re-export the register file and stub generator for the build target.

use nix::unistd::Pid;
use std::fmt;

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use self::x86_64::{encode_branch, flush_icache, CodeGenerator, Registers, BRANCH_SIZE};

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use self::aarch64::{encode_branch, flush_icache, CodeGenerator, Registers, BRANCH_SIZE};

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("bhive only supports x86_64 and aarch64");

/// Every general purpose register except the stack and frame pointers is
/// loaded with this value at the top of each iteration, so memory operands of
/// the block land on one page that the trampoline maps on first touch.
pub const REGISTER_INIT_VALUE: u64 = 0x2324000;

pub const WORD_SIZE: u64 = std::mem::size_of::<libc::c_long>() as u64;

/// The subset of a tracee's register file the controller manipulates.
pub trait RegisterFile: Sized + Copy + fmt::Debug {
    fn read(pid: Pid) -> nix::Result<Self>;
    fn write(&self, pid: Pid) -> nix::Result<()>;

    fn instruction_pointer(&self) -> u64;
    fn set_instruction_pointer(&mut self, ip: u64);

    fn stack_pointer(&self) -> u64;
    fn set_stack_pointer(&mut self, sp: u64);

    fn frame_pointer(&self) -> u64;
    fn set_frame_pointer(&mut self, fp: u64);

    /// First integer argument register of the platform calling convention.
    fn set_first_argument(&mut self, value: u64);
}

/// Runtime routines assembled for one arena layout.
///
/// `stub` is placed at the start of the code window and holds the entry
/// point, the restart point, the loop head and the fault trampoline;
/// `epilogue` follows the unrolled block and ends where the branch back to
/// the loop head is appended.
#[derive(Debug, Clone)]
pub struct CodeImage {
    pub stub: Vec<u8>,
    pub entry_offset: usize,
    pub restart_offset: usize,
    pub loop_head_offset: usize,
    pub trampoline_offset: usize,
    pub epilogue: Vec<u8>,
}

/// The branch displacement does not fit the target's encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchOutOfRange {
    pub from: u64,
    pub to: u64,
}
