use crate::arch::{RegisterFile, Registers};
use crate::arena::ArenaLayout;
use crate::error::{HarnessError, Result};
use crate::events::{EventSink, HarnessEvent};
use nix::unistd::Pid;

/// A `SIGSEGV` intercepted while the block was running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRecord {
    pub signal: i32,
    pub address: u64,
    /// 1-based count of faults seen so far in this run
    pub attempt: u32,
}

/// What to do with a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDisposition {
    /// Alias the data page at the faulting address and restart
    Redirect,
    BudgetExhausted,
    /// The block touched the aux, stack or code window
    ProtectedWindow,
    /// The subject tried to execute from an unmapped address
    InstructionFetch,
}

/// Redirects faulting subjects into the map-and-restart trampoline, at most
/// `max_faults` times per run.
#[derive(Debug)]
pub struct FaultRecoveryController {
    layout: ArenaLayout,
    trampoline_addr: u64,
    max_faults: u32,
    serviced: u32,
}

impl FaultRecoveryController {
    pub fn new(layout: ArenaLayout, trampoline_offset: usize, max_faults: u32) -> Self {
        Self {
            layout,
            trampoline_addr: layout.code_addr + trampoline_offset as u64,
            max_faults,
            serviced: 0,
        }
    }

    pub fn serviced(&self) -> u32 {
        self.serviced
    }

    pub fn trampoline_addr(&self) -> u64 {
        self.trampoline_addr
    }

    pub fn classify(&self, record: &FaultRecord, ip: u64) -> FaultDisposition {
        if self.serviced >= self.max_faults {
            FaultDisposition::BudgetExhausted
        } else if record.address == ip {
            FaultDisposition::InstructionFetch
        } else if self.layout.is_protected(record.address) {
            FaultDisposition::ProtectedWindow
        } else {
            FaultDisposition::Redirect
        }
    }

    /// Points the stopped subject at the trampoline with the faulting
    /// address as its argument. The caller resumes it.
    pub fn service(&mut self, pid: Pid, record: &FaultRecord, sink: &dyn EventSink) -> Result<()> {
        let mut regs = Registers::read(pid)?;
        let ip = regs.instruction_pointer();
        sink.emit(&HarnessEvent::FaultIntercepted {
            signal: record.signal,
            address: record.address,
            ip,
            attempt: record.attempt,
        });

        match self.classify(record, ip) {
            FaultDisposition::Redirect => {}
            FaultDisposition::BudgetExhausted => {
                return Err(HarnessError::FaultBudgetExhausted {
                    max_faults: self.max_faults,
                    last_address: record.address,
                })
            }
            FaultDisposition::ProtectedWindow => {
                return Err(HarnessError::UnrecoverableFault(format!(
                    "access to harness memory at {:#x} (ip {:#x})",
                    record.address, ip
                )))
            }
            FaultDisposition::InstructionFetch => {
                return Err(HarnessError::UnrecoverableFault(format!(
                    "instruction fetch from unmapped {:#x}",
                    record.address
                )))
            }
        }

        regs.set_instruction_pointer(self.trampoline_addr);
        regs.set_first_argument(record.address);
        regs.write(pid)?;
        self.serviced += 1;

        sink.emit(&HarnessEvent::FaultRedirected {
            address: record.address,
            trampoline: self.trampoline_addr,
        });
        Ok(())
    }
}
