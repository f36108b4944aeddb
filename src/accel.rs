use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccelError {
    #[error("accelerator op '{op}' unavailable on this platform")]
    CapabilityUnavailable { op: String },
    #[error("operand length mismatch ({left} vs {right})")]
    LengthMismatch { left: usize, right: usize },
}

/// Read-only capability flags detected once at startup.
///
/// Detection is pure platform inspection; the struct carries no mutable
/// state and is passed by value wherever a caller needs to pick between the
/// accelerated and portable paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceleratorCaps {
    pub wide_vectors: bool,
    pub lanes: usize,
}

impl AcceleratorCaps {
    pub fn detect() -> Self {
        if cfg!(any(target_arch = "x86_64", target_arch = "aarch64")) {
            Self {
                wide_vectors: true,
                lanes: 16,
            }
        } else {
            Self {
                wide_vectors: false,
                lanes: 1,
            }
        }
    }
}

/// Uniform copy/add/mul surface over byte vectors.
///
/// Only the contract is fixed; the implementation is the portable path, with
/// capability flags telling callers what the platform could accelerate.
#[derive(Debug, Clone, Copy)]
pub struct Accelerator {
    caps: AcceleratorCaps,
}

impl Accelerator {
    pub fn new() -> Self {
        Self {
            caps: AcceleratorCaps::detect(),
        }
    }

    pub fn caps(&self) -> AcceleratorCaps {
        self.caps
    }

    pub fn copy(&self, src: &[u8]) -> Vec<u8> {
        src.to_vec()
    }

    /// Lane-wise wrapping add.
    pub fn add(&self, a: &[u8], b: &[u8]) -> Result<Vec<u8>, AccelError> {
        zip_check(a, b)?;
        Ok(a.iter().zip(b).map(|(x, y)| x.wrapping_add(*y)).collect())
    }

    /// Lane-wise wrapping multiply.
    pub fn mul(&self, a: &[u8], b: &[u8]) -> Result<Vec<u8>, AccelError> {
        zip_check(a, b)?;
        Ok(a.iter().zip(b).map(|(x, y)| x.wrapping_mul(*y)).collect())
    }

    /// Named custom op; unsupported names surface `CapabilityUnavailable` so
    /// the caller can fall back to its portable implementation.
    pub fn custom(&self, op: &str, a: &[u8], b: &[u8]) -> Result<Vec<u8>, AccelError> {
        match op {
            "xor" => {
                zip_check(a, b)?;
                Ok(a.iter().zip(b).map(|(x, y)| x ^ y).collect())
            }
            "saturating_add" => {
                zip_check(a, b)?;
                Ok(a.iter().zip(b).map(|(x, y)| x.saturating_add(*y)).collect())
            }
            other => Err(AccelError::CapabilityUnavailable {
                op: other.to_string(),
            }),
        }
    }
}

impl Default for Accelerator {
    fn default() -> Self {
        Self::new()
    }
}

fn zip_check(a: &[u8], b: &[u8]) -> Result<(), AccelError> {
    if a.len() != b.len() {
        return Err(AccelError::LengthMismatch {
            left: a.len(),
            right: b.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_wraps_per_lane() {
        let accel = Accelerator::new();
        let out = accel.add(&[250, 1], &[10, 2]).unwrap();
        assert_eq!(out, vec![4, 3]);
    }

    #[test]
    fn unknown_custom_op_reports_capability() {
        let accel = Accelerator::new();
        let err = accel.custom("fma", &[1], &[2]).unwrap_err();
        assert_eq!(
            err,
            AccelError::CapabilityUnavailable {
                op: "fma".to_string()
            }
        );
    }

    #[test]
    fn mismatched_operands_are_rejected() {
        let accel = Accelerator::new();
        let err = accel.mul(&[1, 2], &[3]).unwrap_err();
        assert!(matches!(err, AccelError::LengthMismatch { .. }));
    }

    #[test]
    fn xor_custom_op_is_supported() {
        let accel = Accelerator::new();
        assert_eq!(accel.custom("xor", &[0b1010], &[0b0110]).unwrap(), vec![0b1100]);
    }
}
