use super::{BranchOutOfRange, CodeImage, RegisterFile, REGISTER_INIT_VALUE};
use crate::arena::AuxOffsets;
use crate::counter::{
    COUNTER_READ_SIZE, PERF_EVENT_IOC_DISABLE, PERF_EVENT_IOC_ENABLE, PERF_EVENT_IOC_RESET,
};
use crate::error::Result;
use crate::subject::SubjectStatus;
use dynasmrt::{aarch64::Aarch64Relocation, dynasm, DynasmApi, DynasmLabelApi, VecAssembler};
use nix::errno::Errno;
use nix::unistd::Pid;
use std::{fmt, mem};

/// `b imm26`
pub const BRANCH_SIZE: usize = 4;

const SYS_READ: u32 = libc::SYS_read as u32;
const SYS_MMAP: u32 = libc::SYS_mmap as u32;
const SYS_IOCTL: u32 = libc::SYS_ioctl as u32;
const SYS_GETPID: u32 = libc::SYS_getpid as u32;
const SYS_KILL: u32 = libc::SYS_kill as u32;

/// Scratch frame reserved before the stop; it travels with the relocated stack.
const FRAME_SIZE: u32 = 64;

/// Emits `movz`/`movk` for a full 64-bit constant into `x<reg>`.
macro_rules! load_imm64 {
    ($ops:ident, $reg:expr, $value:expr) => {{
        let v: u64 = $value;
        dynasm!($ops
            ; .arch aarch64
            ; movz X($reg), (v & 0xffff) as u32
            ; movk X($reg), ((v >> 16) & 0xffff) as u32, lsl 16
            ; movk X($reg), ((v >> 32) & 0xffff) as u32, lsl 32
            ; movk X($reg), ((v >> 48) & 0xffff) as u32, lsl 48
        );
    }};
}

pub struct CodeGenerator;

impl CodeGenerator {
    /// Assembles the stub and the epilogue for an arena whose aux page is
    /// mapped at `aux_addr` in the subject.
    pub fn generate(aux_addr: u64, page_size: u64, data_offset: u64) -> Result<CodeImage> {
        let offsets = AuxOffsets::get();
        let (iterations, remaining, perf_fd, arena_fd) = (
            offsets.iterations as u32,
            offsets.remaining as u32,
            offsets.perf_fd as u32,
            offsets.arena_fd as u32,
        );
        let (saved_sp, saved_fp, restarts) = (
            offsets.saved_sp as u32,
            offsets.saved_fp as u32,
            offsets.restarts as u32,
        );
        let prot = (libc::PROT_READ | libc::PROT_WRITE) as u32;
        let map_flags = (libc::MAP_SHARED | libc::MAP_FIXED) as u32;
        let sigstop = libc::SIGSTOP as u32;

        let mut ops = VecAssembler::<Aarch64Relocation>::new(0);

        // map_and_restart(fault_addr: x0)
        let trampoline = ops.offset().0;
        load_imm64!(ops, 10, !(page_size - 1));
        dynasm!(ops
            ; .arch aarch64
            ; and x0, x0, x10
        );
        load_imm64!(ops, 1, page_size);
        dynasm!(ops
            ; .arch aarch64
            ; movz x2, prot
            ; movz x3, map_flags
        );
        load_imm64!(ops, 9, aux_addr);
        dynasm!(ops
            ; .arch aarch64
            ; ldr x4, [x9, arena_fd]
        );
        load_imm64!(ops, 5, data_offset);
        dynasm!(ops
            ; .arch aarch64
            ; movz x8, SYS_MMAP
            ; svc 0
        );
        load_imm64!(ops, 9, aux_addr);
        dynasm!(ops
            ; .arch aarch64
            ; ldr x10, [x9, restarts]
            ; add x10, x10, 1
            ; str x10, [x9, restarts]
            ; b ->restart
        );
        Self::emit_counter_failure(&mut ops, aux_addr);

        let entry = ops.offset().0;
        dynasm!(ops
            ; .arch aarch64
            ; stp x29, x30, [sp, -16]!
            ; mov x29, sp
            ; sub sp, sp, FRAME_SIZE
        );
        dynasm!(ops
            ; .arch aarch64
            // kill(getpid(), SIGSTOP); the controller moves the stack here
            ; movz x8, SYS_GETPID
            ; svc 0
            ; movz x1, sigstop
            ; movz x8, SYS_KILL
            ; svc 0
        );
        // resumed on the relocated stack
        load_imm64!(ops, 9, aux_addr);
        dynasm!(ops
            ; .arch aarch64
            ; mov x10, sp
            ; str x10, [x9, saved_sp]
            ; str x29, [x9, saved_fp]
        );

        let restart = ops.offset().0;
        dynasm!(ops
            ; .arch aarch64
            ; ->restart:
        );
        load_imm64!(ops, 9, aux_addr);
        dynasm!(ops
            ; .arch aarch64
            ; ldr x10, [x9, saved_sp]
            ; mov sp, x10
            ; ldr x29, [x9, saved_fp]
            ; ldr x10, [x9, iterations]
            ; str x10, [x9, remaining]
            ; ldr x0, [x9, perf_fd]
            ; movz x1, PERF_EVENT_IOC_RESET as u32
            ; movz x2, 0
            ; movz x8, SYS_IOCTL
            ; svc 0
            ; cbnz x0, ->counter_failed
        );
        load_imm64!(ops, 9, aux_addr);
        dynasm!(ops
            ; .arch aarch64
            ; ldr x0, [x9, perf_fd]
            ; movz x1, PERF_EVENT_IOC_ENABLE as u32
            ; movz x2, 0
            ; movz x8, SYS_IOCTL
            ; svc 0
            ; cbnz x0, ->counter_failed
        );

        let loop_head = ops.offset().0;
        load_imm64!(ops, 9, aux_addr);
        dynasm!(ops
            ; .arch aarch64
            ; ldr x10, [x9, saved_sp]
            ; mov sp, x10
            ; ldr x29, [x9, saved_fp]
        );
        load_imm64!(ops, 0, REGISTER_INIT_VALUE);
        for reg in 1..=28u32 {
            dynasm!(ops
                ; .arch aarch64
                ; mov X(reg), x0
            );
        }
        dynasm!(ops
            ; .arch aarch64
            ; mov x30, x0
        );

        let stub = ops.finalize()?;

        Ok(CodeImage {
            stub,
            entry_offset: entry,
            restart_offset: restart,
            loop_head_offset: loop_head,
            trampoline_offset: trampoline,
            epilogue: Self::generate_epilogue(aux_addr)?,
        })
    }

    /// `->counter_failed`: takes the negative errno of a counter syscall in
    /// x0, publishes it with the counter-control status and traps.
    fn emit_counter_failure(ops: &mut VecAssembler<Aarch64Relocation>, aux_addr: u64) {
        let offsets = AuxOffsets::get();
        let (status, status_errno) = (offsets.status as u32, offsets.status_errno as u32);
        let counter_control = SubjectStatus::CounterControl as u32;
        dynasm!(ops
            ; .arch aarch64
            ; ->counter_failed:
            ; neg x0, x0
        );
        load_imm64!(ops, 9, aux_addr);
        dynasm!(ops
            ; .arch aarch64
            ; str x0, [x9, status_errno]
            ; movz x10, counter_control
            ; str x10, [x9, status]
            ; brk 0
        );
    }

    fn generate_epilogue(aux_addr: u64) -> Result<Vec<u8>> {
        let offsets = AuxOffsets::get();
        let (remaining, perf_fd, completed, counter) = (
            offsets.remaining as u32,
            offsets.perf_fd as u32,
            offsets.completed as u32,
            offsets.counter as u32,
        );
        let sigstop = libc::SIGSTOP as u32;
        let read_size = COUNTER_READ_SIZE as u32;
        let short_read = libc::EIO as u32;

        let mut ops = VecAssembler::<Aarch64Relocation>::new(0);
        load_imm64!(ops, 9, aux_addr);
        dynasm!(ops
            ; .arch aarch64
            ; ldr x10, [x9, remaining]
            ; subs x10, x10, 1
            ; str x10, [x9, remaining]
            ; b.ne ->next_iteration
            ; ldr x0, [x9, perf_fd]
            ; movz x1, PERF_EVENT_IOC_DISABLE as u32
            ; movz x2, 0
            ; movz x8, SYS_IOCTL
            ; svc 0
            ; cbnz x0, ->counter_failed
        );
        load_imm64!(ops, 9, aux_addr);
        dynasm!(ops
            ; .arch aarch64
            ; ldr x0, [x9, perf_fd]
            ; add x1, x9, counter
            ; movz x2, read_size
            ; movz x8, SYS_READ
            ; svc 0
            ; cmp x0, read_size
            ; b.eq ->read_done
            ; cmp x0, 0
            ; b.lt ->counter_failed
            // short read
            ; movz x0, short_read
            ; neg x0, x0
        );
        Self::emit_counter_failure(&mut ops, aux_addr);
        dynasm!(ops
            ; .arch aarch64
            ; ->read_done:
        );
        load_imm64!(ops, 9, aux_addr);
        dynasm!(ops
            ; .arch aarch64
            ; movz x10, 1
            ; str x10, [x9, completed]
            ; movz x8, SYS_GETPID
            ; svc 0
            ; movz x1, sigstop
            ; movz x8, SYS_KILL
            ; svc 0
            ; brk 0
            ; ->next_iteration:
        );

        Ok(ops.finalize()?)
    }
}

/// Encodes `b imm26` placed at `from` and landing on `to`.
pub fn encode_branch(from: u64, to: u64) -> std::result::Result<[u8; BRANCH_SIZE], BranchOutOfRange> {
    let disp = to as i128 - from as i128;
    if disp % 4 != 0 || disp < -(1 << 27) || disp >= (1 << 27) {
        return Err(BranchOutOfRange { from, to });
    }
    let imm26 = ((disp >> 2) as u32) & 0x03ff_ffff;
    Ok((0x1400_0000 | imm26).to_le_bytes())
}

/// Makes freshly written instructions visible to instruction fetch.
pub fn flush_icache(addr: *const u8, len: usize) {
    unsafe {
        // 1. Clean data cache by VA to PoU (Point of Unification)
        // 2. Invalidate instruction cache by VA to PoU
        // 3. ISB to flush the fetch pipeline
        let start = addr as usize;
        let end = start + len;
        let stride = 64;

        let mut line = start & !(stride - 1);
        while line < end {
            std::arch::asm!("dc cvau, {0}", in(reg) line);
            line += stride;
        }
        std::arch::asm!("dsb ish");

        line = start & !(stride - 1);
        while line < end {
            std::arch::asm!("ic ivau, {0}", in(reg) line);
            line += stride;
        }
        std::arch::asm!("dsb ish");
        std::arch::asm!("isb");
    }
}

#[derive(Clone, Copy)]
pub struct Registers(libc::user_regs_struct);

impl fmt::Debug for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registers")
            .field("pc", &format_args!("{:#x}", self.0.pc))
            .field("sp", &format_args!("{:#x}", self.0.sp))
            .field("x29", &format_args!("{:#x}", self.0.regs[29]))
            .field("x0", &format_args!("{:#x}", self.0.regs[0]))
            .field("x30", &format_args!("{:#x}", self.0.regs[30]))
            .finish()
    }
}

// PTRACE_GETREGS does not exist on arm64; the general purpose set is
// transferred through PTRACE_{GET,SET}REGSET with NT_PRSTATUS.
fn regset(request: libc::c_uint, pid: Pid, regs: &mut libc::user_regs_struct) -> nix::Result<()> {
    let mut iov = libc::iovec {
        iov_base: (regs as *mut libc::user_regs_struct).cast(),
        iov_len: mem::size_of::<libc::user_regs_struct>(),
    };
    let ret = unsafe {
        libc::ptrace(
            request,
            pid.as_raw(),
            libc::NT_PRSTATUS as usize as *mut libc::c_void,
            &mut iov as *mut libc::iovec,
        )
    };
    Errno::result(ret).map(drop)
}

#[rustfmt::skip]
impl RegisterFile for Registers {
    fn read(pid: Pid) -> nix::Result<Self> {
        let mut regs: libc::user_regs_struct = unsafe { mem::zeroed() };
        regset(libc::PTRACE_GETREGSET, pid, &mut regs)?;
        Ok(Registers(regs))
    }
    fn write(&self, pid: Pid) -> nix::Result<()> {
        let mut regs = self.0;
        regset(libc::PTRACE_SETREGSET, pid, &mut regs)
    }

    fn instruction_pointer(&self) -> u64 { self.0.pc }
    fn set_instruction_pointer(&mut self, ip: u64) { self.0.pc = ip }

    fn stack_pointer(&self) -> u64 { self.0.sp }
    fn set_stack_pointer(&mut self, sp: u64) { self.0.sp = sp }

    fn frame_pointer(&self) -> u64 { self.0.regs[29] }
    fn set_frame_pointer(&mut self, fp: u64) { self.0.regs[29] = fp }

    fn set_first_argument(&mut self, value: u64) { self.0.regs[0] = value }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaLayout;

    #[test]
    fn test_branch_encoding() {
        // b .
        assert_eq!(encode_branch(0x1000, 0x1000).unwrap(), 0x1400_0000u32.to_le_bytes());
        // b .-8
        assert_eq!(encode_branch(0x1008, 0x1000).unwrap(), 0x17ff_fffeu32.to_le_bytes());
        assert!(encode_branch(0x1000, 0x1002).is_err());
        assert!(encode_branch(0, 1 << 30).is_err());
    }

    #[test]
    fn test_stub_layout() {
        let image = CodeGenerator::generate(ArenaLayout::aux_addr_for(4096), 4096, 0).unwrap();
        assert_eq!(image.trampoline_offset, 0);
        assert!(image.entry_offset < image.restart_offset);
        assert!(image.restart_offset < image.loop_head_offset);
        assert_eq!(image.stub.len() % 4, 0);
        assert_eq!(image.epilogue.len() % 4, 0);
    }

    #[test]
    fn test_counter_syscalls_are_checked() {
        let image = CodeGenerator::generate(ArenaLayout::aux_addr_for(4096), 4096, 0).unwrap();
        let words = |code: &[u8]| -> Vec<u32> {
            code.chunks_exact(4)
                .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
                .collect()
        };
        // cbnz x0, <label>
        let is_cbnz_x0 = |w: &u32| w & 0xff00_001f == 0xb500_0000;
        let restart = words(&image.stub[image.restart_offset..image.loop_head_offset]);
        assert_eq!(restart.iter().filter(|w| is_cbnz_x0(w)).count(), 2);
        // ldur x0, [x29, #imm] would read the relocated frame
        let after_stop = words(&image.stub[image.entry_offset..]);
        assert!(!after_stop.iter().any(|w| w & 0xffe0_03ff == 0xf840_03a0));

        // brk #0
        let brk = 0xd420_0000u32;
        assert_eq!(words(&image.epilogue).iter().filter(|w| **w == brk).count(), 2);
    }

    #[test]
    fn test_register_accessors() {
        let raw: libc::user_regs_struct = unsafe { mem::zeroed() };
        let mut regs = Registers(raw);
        regs.set_stack_pointer(0x7000);
        regs.set_frame_pointer(0x7040);
        regs.set_first_argument(0x2324000);
        assert_eq!(regs.frame_pointer() - regs.stack_pointer(), 0x40);
        assert_eq!(regs.0.regs[0], 0x2324000);
    }
}
