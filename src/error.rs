//! Error Types for bhive
//!
//! Every fatal path of a measurement ends in one of these variants. The
//! orchestrator never returns a partial cycle count next to an error.

use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified error type for harness operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HarnessError {
    /// The test image or a harness parameter is unusable
    InvalidInput(String),
    /// The shared arena could not be created or mapped
    ResourceExhaustion(String),
    /// fork, ptrace or wait failed
    ProcessControl(Errno),
    /// The subject did not follow the stop protocol
    ProtocolViolation(String),
    /// The subject exited during its bootstrap
    SubjectSetup { stage: String, errno: i32 },
    /// A counter ioctl or read failed inside the measurement loop
    CounterControl { errno: i32 },
    /// Stack copy verification found differing words
    RelocationIntegrity { mismatches: usize },
    /// The counter name could not be encoded
    CounterResolution(String),
    /// The counter could not be opened on this host
    CounterUnavailable(String),
    /// More faults than the configured budget
    FaultBudgetExhausted { max_faults: u32, last_address: u64 },
    /// A fault the trampoline cannot service
    UnrecoverableFault(String),
    /// The subject stopped on a foreign signal or died
    SubjectTerminated(String),
    /// The runtime stub could not be assembled
    CodeGeneration(String),
    /// Invalid configuration
    ConfigError(String),
    /// I/O operation failed
    IoError(String),
}

impl HarnessError {
    /// True when the failure comes from the host refusing ptrace or perf
    /// access rather than from the block under test.
    pub fn is_environmental(&self) -> bool {
        match self {
            HarnessError::CounterUnavailable(_) => true,
            HarnessError::SubjectSetup { stage, .. } => stage == "trace request",
            HarnessError::ProcessControl(errno) => {
                matches!(*errno, Errno::EPERM | Errno::EACCES | Errno::ENOSYS)
            }
            _ => false,
        }
    }
}

impl fmt::Display for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HarnessError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            HarnessError::ResourceExhaustion(msg) => write!(f, "Arena error: {}", msg),
            HarnessError::ProcessControl(errno) => {
                write!(f, "Process control error: {:?}: {}", errno, errno.desc())
            }
            HarnessError::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
            HarnessError::SubjectSetup { stage, errno } => write!(
                f,
                "Subject setup failed during {}: {}",
                stage,
                std::io::Error::from_raw_os_error(*errno)
            ),
            HarnessError::CounterControl { errno } => write!(
                f,
                "Counter control failed in the measurement loop: {}",
                std::io::Error::from_raw_os_error(*errno)
            ),
            HarnessError::RelocationIntegrity { mismatches } => write!(
                f,
                "Stack relocation integrity fault: {} mismatching words",
                mismatches
            ),
            HarnessError::CounterResolution(msg) => write!(f, "Counter resolution error: {}", msg),
            HarnessError::CounterUnavailable(msg) => write!(f, "Counter unavailable: {}", msg),
            HarnessError::FaultBudgetExhausted {
                max_faults,
                last_address,
            } => write!(
                f,
                "Fault budget of {} exhausted (last fault at {:#x})",
                max_faults, last_address
            ),
            HarnessError::UnrecoverableFault(msg) => write!(f, "Unrecoverable fault: {}", msg),
            HarnessError::SubjectTerminated(msg) => write!(f, "Subject terminated: {}", msg),
            HarnessError::CodeGeneration(msg) => write!(f, "Code generation error: {}", msg),
            HarnessError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            HarnessError::IoError(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for HarnessError {}

/// Result type alias for harness operations
pub type Result<T> = std::result::Result<T, HarnessError>;

impl From<std::io::Error> for HarnessError {
    fn from(err: std::io::Error) -> Self {
        HarnessError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for HarnessError {
    fn from(err: serde_json::Error) -> Self {
        HarnessError::ConfigError(format!("JSON error: {}", err))
    }
}

impl From<nix::Error> for HarnessError {
    fn from(err: nix::Error) -> Self {
        HarnessError::ProcessControl(err)
    }
}

impl From<dynasmrt::DynasmError> for HarnessError {
    fn from(err: dynasmrt::DynasmError) -> Self {
        HarnessError::CodeGeneration(err.to_string())
    }
}

/// Size limits applied to a test image before anything is forked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockLimits {
    /// Maximum size of a single block in bytes
    pub max_block_size: usize,
    /// Maximum unroll factor
    pub max_unroll_factor: u32,
    /// Maximum size of the executable window in bytes
    pub max_code_size: usize,
}

impl Default for BlockLimits {
    fn default() -> Self {
        Self {
            max_block_size: 4096,          // 4 KB
            max_unroll_factor: 100_000,    // 100K copies
            max_code_size: 64 * 1024 * 1024, // 64 MB
        }
    }
}

impl BlockLimits {
    /// Limits for fuzzing-style inputs
    pub fn strict() -> Self {
        Self {
            max_block_size: 256,
            max_unroll_factor: 1_000,
            max_code_size: 1024 * 1024, // 1 MB
        }
    }

    /// Limits for large hand-written blocks
    pub fn relaxed() -> Self {
        Self {
            max_block_size: 64 * 1024,      // 64 KB
            max_unroll_factor: 10_000_000,  // 10M copies
            max_code_size: 120 * 1024 * 1024, // aarch64 B reaches +/-128 MB
        }
    }

    /// Check if the block size is within limits
    pub fn check_block_size(&self, size: usize) -> Result<()> {
        if size > self.max_block_size {
            return Err(HarnessError::InvalidInput(format!(
                "Block size {} bytes exceeds limit {} bytes",
                size, self.max_block_size
            )));
        }
        Ok(())
    }

    /// Check if the unroll factor is within limits
    pub fn check_unroll_factor(&self, unroll_factor: u32) -> Result<()> {
        if unroll_factor > self.max_unroll_factor {
            return Err(HarnessError::InvalidInput(format!(
                "Unroll factor {} exceeds limit {}",
                unroll_factor, self.max_unroll_factor
            )));
        }
        Ok(())
    }

    /// Check if the executable footprint is within limits
    pub fn check_code_size(&self, size: usize) -> Result<()> {
        if size > self.max_code_size {
            return Err(HarnessError::InvalidInput(format!(
                "Code size {} bytes exceeds limit {} bytes",
                size, self.max_code_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HarnessError::FaultBudgetExhausted {
            max_faults: 4,
            last_address: 0x2324000,
        };
        let msg = err.to_string();
        assert!(msg.contains("Fault budget of 4"));
        assert!(msg.contains("0x2324000"));
    }

    #[test]
    fn test_subject_setup_display_uses_errno() {
        let err = HarnessError::SubjectSetup {
            stage: "code mapping".to_string(),
            errno: libc::EEXIST,
        };
        assert!(err.to_string().contains("code mapping"));
    }

    #[test]
    fn test_environmental_classification() {
        assert!(HarnessError::CounterUnavailable("EACCES".into()).is_environmental());
        assert!(HarnessError::SubjectSetup {
            stage: "trace request".into(),
            errno: libc::EPERM
        }
        .is_environmental());
        assert!(!HarnessError::InvalidInput("empty".into()).is_environmental());
        assert!(!HarnessError::CounterControl { errno: libc::EBADF }.is_environmental());
    }

    #[test]
    fn test_process_control_classified_by_errno() {
        assert!(HarnessError::from(Errno::EPERM).is_environmental());
        assert!(HarnessError::from(Errno::ENOSYS).is_environmental());
        assert!(!HarnessError::from(Errno::ESRCH).is_environmental());
        assert!(!HarnessError::from(Errno::ECHILD).is_environmental());
        let err = HarnessError::from(Errno::EACCES);
        assert!(err.is_environmental());
        assert!(err.to_string().contains("EACCES"));
    }

    #[test]
    fn test_block_limits_default() {
        let limits = BlockLimits::default();
        assert!(limits.check_block_size(15).is_ok());
        assert!(limits.check_block_size(10_000).is_err());
        assert!(limits.check_unroll_factor(100).is_ok());
    }

    #[test]
    fn test_block_limits_strict() {
        let limits = BlockLimits::strict();
        assert!(limits.check_unroll_factor(1_000).is_ok());
        assert!(limits.check_unroll_factor(1_001).is_err());
        assert!(limits.check_code_size(2 * 1024 * 1024).is_err());
    }
}
