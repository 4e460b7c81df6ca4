use thiserror::Error;

/// Architectural faults the core can raise while executing guest code.
///
/// These are recoverable from the guest's point of view: the scheduler turns
/// them into the corresponding interrupt vector and keeps running.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    #[error("#DE divide error")]
    DivideError,

    #[error("#UD invalid opcode {0:#04x}")]
    InvalidOpcode(u8),
}

impl Exception {
    /// The real-mode interrupt vector this fault is delivered through.
    pub fn vector(self) -> u8 {
        match self {
            Exception::DivideError => 0,
            Exception::InvalidOpcode(_) => 6,
        }
    }
}
