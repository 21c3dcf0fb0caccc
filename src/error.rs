//! Error types shared by every emulator component.
//!
//! All failures inside the emulator are synchronous and fatal for the kernel
//! that triggered them. They propagate with `?` up to the caller of
//! [`Scheduler::run`](crate::schedule::Scheduler::run) or
//! [`Machine::launch_kernels`](crate::device::Machine::launch_kernels).

use thiserror::Error;

/// Emulator error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmuError {
    /// A NoC coordinate does not map to a DRAM or worker core, or the grid
    /// description is inconsistent.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An internal precondition was broken (DST index, CB id, command buffer).
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The operation exists but is not emulated for these arguments.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Access outside a memory bank.
    #[error("memory access out of bounds: addr=0x{addr:08X} len={len} size=0x{size:08X}")]
    MemoryOutOfBounds { addr: u64, len: usize, size: u64 },

    /// A worker panicked while holding the scheduler baton.
    #[error("worker {worker} panicked: {message}")]
    WorkerPanicked { worker: usize, message: String },
}

impl EmuError {
    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        EmuError::InvariantViolation(msg.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        EmuError::Configuration(msg.into())
    }

    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        EmuError::Unsupported(msg.into())
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, EmuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EmuError::config("No DRAM or worker core at (0, 4)");
        assert_eq!(err.to_string(), "configuration error: No DRAM or worker core at (0, 4)");

        let err = EmuError::MemoryOutOfBounds { addr: 0x100, len: 4, size: 0x100 };
        assert!(err.to_string().contains("0x00000100"));
    }
}
