//! Error types for programming operations

use std::path::PathBuf;

use thiserror::Error;

/// One byte that read back differently from what was written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    /// Offset from the start of the region
    pub index: usize,
    pub expected: u8,
    pub actual: u8,
}

/// Failures reported by a bus session
#[derive(Debug, Error)]
pub enum BusError {
    /// The target didn't answer within the configured timeout
    #[error("{0} timed out")]
    Timeout(String),

    /// Any other transport failure
    #[error(transparent)]
    Transfer(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    /// Unknown memory type or erase target
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Firmware file can't be read or parsed
    #[error("Failed to load firmware image {}: {source}", path.display())]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    /// Image is larger than the target region
    #[error(
        "File {} appears to be {size} bytes, larger than {region} size of {capacity}",
        path.display()
    )]
    CapacityExceeded {
        path: PathBuf,
        size: usize,
        region: String,
        capacity: u32,
    },

    /// Bus didn't respond in time, notably on a full chip erase
    #[error("Bus timeout: {0}")]
    Timeout(String),

    /// Any other bus failure
    #[error("Bus error: {0}")]
    Bus(#[source] anyhow::Error),

    /// Read-back differs from the written data
    #[error(
        "Verify of {} against {region} failed, {} mismatching byte(s), first at 0x{:04x}",
        path.display(),
        mismatches.len(),
        mismatches.first().map(|m| m.index).unwrap_or_default()
    )]
    VerifyFailed {
        path: PathBuf,
        region: String,
        bytes_written: usize,
        mismatches: Vec<Mismatch>,
    },
}

impl From<BusError> for Error {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Timeout(what) => Error::Timeout(what),
            BusError::Transfer(source) => Error::Bus(source),
        }
    }
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_timeout_stays_distinguishable() {
        let err: Error = BusError::Timeout("erase chip".into()).into();
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "Bus timeout: erase chip");

        let err: Error = BusError::Transfer(anyhow::anyhow!("pipe error")).into();
        assert!(!err.is_timeout());
        assert!(matches!(err, Error::Bus(_)));
    }

    #[test]
    fn capacity_message_carries_context() {
        let err = Error::CapacityExceeded {
            path: "fw.hex".into(),
            size: 0x30000,
            region: "flash".into(),
            capacity: 0x22000,
        };
        assert_eq!(
            err.to_string(),
            "File fw.hex appears to be 196608 bytes, larger than flash size of 139264"
        );
    }

    #[test]
    fn verify_message_names_first_mismatch() {
        let err = Error::VerifyFailed {
            path: "fw.hex".into(),
            region: "flash".into(),
            bytes_written: 16,
            mismatches: vec![
                Mismatch { index: 0x0c, expected: 0x12, actual: 0xff },
                Mismatch { index: 0x0d, expected: 0x34, actual: 0xff },
            ],
        };
        assert_eq!(
            err.to_string(),
            "Verify of fw.hex against flash failed, 2 mismatching byte(s), first at 0x000c"
        );
    }
}
