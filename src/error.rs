use nix::errno::Errno;
use thiserror::Error;

use crate::ip_block::IpType;

#[derive(Debug, Error)]
pub enum Error {
    /// A kernel (or simulated kernel) call failed; `errno` is the exact code.
    #[error("{op} failed: {errno}")]
    Kernel { op: &'static str, errno: Errno },

    #[error("unsupported ASIC: family {family_id}, external revision {chip_external_rev:#x}")]
    UnsupportedAsic {
        family_id: u32,
        chip_external_rev: u32,
    },

    #[error("no {0:?} ip block registered for this device")]
    IpBlockNotFound(IpType),

    #[error("{what} is not supported on this device")]
    Unsupported { what: &'static str },

    #[error("command buffer needs {requested} dwords but holds {capacity}")]
    CapacityExceeded { requested: usize, capacity: usize },

    #[error("command buffer is already attached to external storage")]
    AlreadyAttached,

    #[error("{what} {value:#x} is not aligned to {alignment}")]
    Misaligned {
        what: &'static str,
        value: u64,
        alignment: u64,
    },

    #[error("no {kind} shader for gfx version {version}")]
    UnsupportedShader { kind: &'static str, version: u32 },

    #[error("destination too small: need {needed} bytes, have {available}")]
    DestinationTooSmall { needed: usize, available: usize },

    #[error("mismatch at dword {index}: expected {expected:#010x}, found {found:#010x}")]
    Mismatch {
        index: usize,
        expected: u32,
        found: u32,
    },

    #[error("fence did not signal under an infinite wait")]
    FenceNotExpired,

    #[error("hung dispatch completed as if it had run normally")]
    HangNotDetected,

    #[error("unexpected reset state: expected {expected}, got {found}")]
    UnexpectedResetState { expected: u32, found: u32 },

    #[error("value {value:#x} overflows {width}-bit field {field}")]
    FieldOverflow {
        field: &'static str,
        value: u32,
        width: u32,
    },

    #[error("batch overflow: offset {offset:#x} + {len} exceeds {size:#x}")]
    BatchOverflow { offset: u32, len: u32, size: u32 },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn kernel(op: &'static str, errno: Errno) -> Self {
        Error::Kernel { op, errno }
    }

    pub fn errno(&self) -> Option<Errno> {
        match self {
            Error::Kernel { errno, .. } => Some(*errno),
            _ => None,
        }
    }

    /// Submission or wait refused because the context was torn down by a reset.
    pub fn is_canceled(&self) -> bool {
        self.errno() == Some(Errno::ECANCELED)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_kernel_codes() {
        let err = Error::kernel("cs_submit", Errno::ECANCELED);
        assert!(err.is_canceled());
        assert_eq!(err.errno(), Some(Errno::ECANCELED));
        assert!(!Error::FenceNotExpired.is_canceled());
        assert_eq!(
            Error::CapacityExceeded {
                requested: 9,
                capacity: 8
            }
            .to_string(),
            "command buffer needs 9 dwords but holds 8"
        );
    }
}
