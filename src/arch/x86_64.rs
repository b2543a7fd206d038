use super::{BranchOutOfRange, CodeImage, RegisterFile, REGISTER_INIT_VALUE};
use crate::arena::AuxOffsets;
use crate::counter::{
    COUNTER_READ_SIZE, PERF_EVENT_IOC_DISABLE, PERF_EVENT_IOC_ENABLE, PERF_EVENT_IOC_RESET,
};
use crate::error::Result;
use crate::subject::SubjectStatus;
use dynasmrt::{dynasm, x64::X64Relocation, DynasmApi, DynasmLabelApi, VecAssembler};
use nix::sys::ptrace;
use nix::unistd::Pid;
use std::fmt;

/// `jmp rel32`
pub const BRANCH_SIZE: usize = 5;

const SYS_READ: i32 = libc::SYS_read as i32;
const SYS_MMAP: i32 = libc::SYS_mmap as i32;
const SYS_IOCTL: i32 = libc::SYS_ioctl as i32;
const SYS_GETPID: i32 = libc::SYS_getpid as i32;
const SYS_KILL: i32 = libc::SYS_kill as i32;

/// Scratch frame the entry point reserves before stopping. The controller
/// copies it word for word onto the relocated stack.
const FRAME_SIZE: i32 = 64;

pub struct CodeGenerator;

impl CodeGenerator {
    /// Assembles the stub and the epilogue for an arena whose aux page is
    /// mapped at `aux_addr` in the subject.
    pub fn generate(aux_addr: u64, page_size: u64, data_offset: u64) -> Result<CodeImage> {
        let offsets = AuxOffsets::get();
        let aux = aux_addr as i64;
        let init = REGISTER_INIT_VALUE as i64;
        let page_mask = !(page_size as i64 - 1);
        let page = page_size as i32;
        let data_offset = data_offset as i64;
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let map_flags = libc::MAP_SHARED | libc::MAP_FIXED;
        let sigstop = libc::SIGSTOP;
        let (iterations, remaining, perf_fd, arena_fd) = (
            offsets.iterations,
            offsets.remaining,
            offsets.perf_fd,
            offsets.arena_fd,
        );
        let (saved_sp, saved_fp, restarts) =
            (offsets.saved_sp, offsets.saved_fp, offsets.restarts);

        let mut ops = VecAssembler::<X64Relocation>::new(0);

        // map_and_restart(fault_addr: rdi)
        // Aliases the arena data page over the faulting page and starts the
        // measurement over. Runs on whatever stack the block left behind, so
        // it touches no memory through rsp.
        let trampoline = ops.offset().0;
        dynasm!(ops
            ; .arch x64
            ; mov rax, QWORD page_mask
            ; and rdi, rax
            ; mov esi, page
            ; mov edx, prot
            ; mov r10d, map_flags
            ; mov rax, QWORD aux
            ; mov r8, [rax + arena_fd]
            ; mov r9, QWORD data_offset
            ; mov eax, SYS_MMAP
            ; syscall
            ; mov rax, QWORD aux
            ; add QWORD [rax + restarts], 1
            ; jmp ->restart
        );
        Self::emit_counter_failure(&mut ops, aux);

        let entry = ops.offset().0;
        dynasm!(ops
            ; .arch x64
            ; push rbp
            ; mov rbp, rsp
            ; sub rsp, FRAME_SIZE
            // kill(getpid(), SIGSTOP); the controller moves the stack here
            ; mov eax, SYS_GETPID
            ; syscall
            ; mov edi, eax
            ; mov esi, sigstop
            ; mov eax, SYS_KILL
            ; syscall
            // resumed on the relocated stack
            ; mov rax, QWORD aux
            ; mov [rax + saved_sp], rsp
            ; mov [rax + saved_fp], rbp
        );

        // Everything after this point reads harness state from aux only; the
        // block may have overwritten any stack slot.
        let restart = ops.offset().0;
        dynasm!(ops
            ; .arch x64
            ; ->restart:
            ; mov rax, QWORD aux
            ; mov rsp, [rax + saved_sp]
            ; mov rbp, [rax + saved_fp]
            ; mov rcx, [rax + iterations]
            ; mov [rax + remaining], rcx
            ; mov rdi, [rax + perf_fd]
            ; mov esi, PERF_EVENT_IOC_RESET
            ; xor edx, edx
            ; mov eax, SYS_IOCTL
            ; syscall
            ; test rax, rax
            ; jnz ->counter_failed
            ; mov rax, QWORD aux
            ; mov rdi, [rax + perf_fd]
            ; mov esi, PERF_EVENT_IOC_ENABLE
            ; xor edx, edx
            ; mov eax, SYS_IOCTL
            ; syscall
            ; test rax, rax
            ; jnz ->counter_failed
        );

        // Identical architectural state at the top of every iteration.
        let loop_head = ops.offset().0;
        dynasm!(ops
            ; .arch x64
            ; mov rax, QWORD aux
            ; mov rsp, [rax + saved_sp]
            ; mov rbp, [rax + saved_fp]
            ; mov rax, QWORD init
            ; mov rbx, rax
            ; mov rcx, rax
            ; mov rdx, rax
            ; mov rsi, rax
            ; mov rdi, rax
            ; mov r8, rax
            ; mov r9, rax
            ; mov r10, rax
            ; mov r11, rax
            ; mov r12, rax
            ; mov r13, rax
            ; mov r14, rax
            ; mov r15, rax
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
    /// rax, publishes it with the counter-control status and traps.
    fn emit_counter_failure(ops: &mut VecAssembler<X64Relocation>, aux: i64) {
        let offsets = AuxOffsets::get();
        let (status, status_errno) = (offsets.status, offsets.status_errno);
        let counter_control = SubjectStatus::CounterControl as i32;
        dynasm!(ops
            ; .arch x64
            ; ->counter_failed:
            ; neg rax
            ; mov rcx, QWORD aux
            ; mov [rcx + status_errno], rax
            ; mov QWORD [rcx + status], counter_control
            ; ud2
        );
    }

    /// Counts down the remaining iterations. While any are left it falls off
    /// its end onto the appended branch; on the last one it stops the
    /// counter, stores the reading and halts with SIGSTOP.
    fn generate_epilogue(aux_addr: u64) -> Result<Vec<u8>> {
        let offsets = AuxOffsets::get();
        let aux = aux_addr as i64;
        let sigstop = libc::SIGSTOP;
        let read_size = COUNTER_READ_SIZE as i32;
        let short_read = -libc::EIO;
        let (remaining, perf_fd, completed, counter) = (
            offsets.remaining,
            offsets.perf_fd,
            offsets.completed,
            offsets.counter,
        );

        let mut ops = VecAssembler::<X64Relocation>::new(0);
        dynasm!(ops
            ; .arch x64
            ; mov rax, QWORD aux
            ; sub QWORD [rax + remaining], 1
            ; jnz ->next_iteration
            ; mov rdi, [rax + perf_fd]
            ; mov esi, PERF_EVENT_IOC_DISABLE
            ; xor edx, edx
            ; mov eax, SYS_IOCTL
            ; syscall
            ; test rax, rax
            ; jnz ->counter_failed
            ; mov rax, QWORD aux
            ; mov rdi, [rax + perf_fd]
            ; lea rsi, [rax + counter]
            ; mov edx, read_size
            ; mov eax, SYS_READ
            ; syscall
            ; cmp rax, read_size
            ; je ->read_done
            ; test rax, rax
            ; js ->counter_failed
            ; mov rax, short_read
        );
        Self::emit_counter_failure(&mut ops, aux);
        dynasm!(ops
            ; .arch x64
            ; ->read_done:
            ; mov rax, QWORD aux
            ; mov QWORD [rax + completed], 1
            ; mov eax, SYS_GETPID
            ; syscall
            ; mov edi, eax
            ; mov esi, sigstop
            ; mov eax, SYS_KILL
            ; syscall
            ; ud2
            ; ->next_iteration:
        );

        Ok(ops.finalize()?)
    }
}

/// Encodes `jmp rel32` placed at `from` and landing on `to`.
pub fn encode_branch(from: u64, to: u64) -> std::result::Result<[u8; BRANCH_SIZE], BranchOutOfRange> {
    let next = from as i128 + BRANCH_SIZE as i128;
    let disp = i32::try_from(to as i128 - next).map_err(|_| BranchOutOfRange { from, to })?;
    let d = disp.to_le_bytes();
    Ok([0xe9, d[0], d[1], d[2], d[3]])
}

/// x86 keeps instruction fetch coherent with stores to the same address
/// space; draining the store buffer is enough before jumping in.
pub fn flush_icache(_addr: *const u8, _len: usize) {
    unsafe {
        std::arch::asm!("mfence", options(nostack));
    }
}

#[derive(Clone, Copy)]
pub struct Registers(libc::user_regs_struct);

impl fmt::Debug for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registers")
            .field("rip", &format_args!("{:#x}", self.0.rip))
            .field("rsp", &format_args!("{:#x}", self.0.rsp))
            .field("rbp", &format_args!("{:#x}", self.0.rbp))
            .field("rax", &format_args!("{:#x}", self.0.rax))
            .field("rdi", &format_args!("{:#x}", self.0.rdi))
            .finish()
    }
}

#[rustfmt::skip]
impl RegisterFile for Registers {
    fn read(pid: Pid) -> nix::Result<Self> { ptrace::getregs(pid).map(Registers) }
    fn write(&self, pid: Pid) -> nix::Result<()> { ptrace::setregs(pid, self.0) }

    fn instruction_pointer(&self) -> u64 { self.0.rip }
    fn set_instruction_pointer(&mut self, ip: u64) { self.0.rip = ip }

    fn stack_pointer(&self) -> u64 { self.0.rsp }
    fn set_stack_pointer(&mut self, sp: u64) { self.0.rsp = sp }

    fn frame_pointer(&self) -> u64 { self.0.rbp }
    fn set_frame_pointer(&mut self, fp: u64) { self.0.rbp = fp }

    fn set_first_argument(&mut self, value: u64) { self.0.rdi = value }
}
