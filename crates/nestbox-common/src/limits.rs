//! Human-readable resource limits and their cgroup v2 encodings.
//!
//! CPU limits are fractional core counts (`"1"`, `"0.5"`) or `"unlimited"`,
//! written to `cpu.max` as `"<quota> <period>"` with a fixed period of
//! [`CPU_PERIOD_US`]. Memory limits are byte counts with an optional
//! `K`/`M`/`G` suffix (powers of 1024) or `"unlimited"`, written to
//! `memory.max`. The kernel spells "unlimited" as `max`, which is accepted
//! as an input alias.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{CPU_MIN_QUOTA_US, CPU_PERIOD_US};
use crate::error::{NestboxError, Result};

const UNLIMITED: &str = "unlimited";
const KERNEL_MAX: &str = "max";

fn is_unlimited(s: &str) -> bool {
    s.eq_ignore_ascii_case(UNLIMITED) || s.eq_ignore_ascii_case(KERNEL_MAX)
}

/// A CPU bandwidth limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuLimit {
    /// No quota.
    #[default]
    Unlimited,
    /// At most `quota_us` microseconds of CPU time per `period_us`.
    Quota {
        /// Allowed CPU time per period.
        quota_us: u64,
        /// Length of the accounting period.
        period_us: u64,
    },
}

impl CpuLimit {
    /// Parses a core count such as `"1"`, `"0.5"`, `"2.25"`, or `"unlimited"`.
    ///
    /// The quota is `round(period * cores)`.
    ///
    /// # Errors
    ///
    /// Returns [`NestboxError::InvalidInput`] if the value is not a positive
    /// finite number or rounds to a quota below the kernel minimum.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn parse(input: &str) -> Result<Self> {
        let s = input.trim();
        if is_unlimited(s) {
            return Ok(Self::Unlimited);
        }
        let cores: f64 = s
            .parse()
            .map_err(|_| NestboxError::invalid(format!("invalid CPU limit format: {input:?}")))?;
        if !cores.is_finite() || cores <= 0.0 {
            return Err(NestboxError::invalid(format!(
                "CPU limit must be a positive number of cores: {input:?}"
            )));
        }
        let quota = (CPU_PERIOD_US as f64 * cores).round();
        if quota < CPU_MIN_QUOTA_US as f64 || quota >= u64::MAX as f64 {
            return Err(NestboxError::invalid(format!(
                "CPU limit {input:?} is outside the range the kernel accepts"
            )));
        }
        Ok(Self::Quota {
            quota_us: quota as u64,
            period_us: CPU_PERIOD_US,
        })
    }

    /// Value to write into `cpu.max`.
    #[must_use]
    pub fn to_cgroup(&self) -> String {
        match self {
            Self::Unlimited => format!("{KERNEL_MAX} {CPU_PERIOD_US}"),
            Self::Quota {
                quota_us,
                period_us,
            } => format!("{quota_us} {period_us}"),
        }
    }
}

impl fmt::Display for CpuLimit {
    #[allow(clippy::cast_precision_loss)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unlimited => f.write_str(UNLIMITED),
            Self::Quota {
                quota_us,
                period_us,
            } => write!(f, "{}", *quota_us as f64 / *period_us as f64),
        }
    }
}

/// A hard memory ceiling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryLimit {
    /// No ceiling.
    #[default]
    Unlimited,
    /// At most this many bytes.
    Bytes(u64),
}

impl MemoryLimit {
    /// Parses `"512M"`, `"1G"`, `"64k"`, `"1048576"`, or `"unlimited"`.
    ///
    /// Suffixes are case-insensitive powers of 1024.
    ///
    /// # Errors
    ///
    /// Returns [`NestboxError::InvalidInput`] if the number is missing,
    /// not a positive integer, or overflows when scaled.
    pub fn parse(input: &str) -> Result<Self> {
        let s = input.trim();
        if is_unlimited(s) {
            return Ok(Self::Unlimited);
        }
        let (digits, multiplier) = match s.char_indices().last() {
            Some((i, 'k' | 'K')) => (&s[..i], 1u64 << 10),
            Some((i, 'm' | 'M')) => (&s[..i], 1 << 20),
            Some((i, 'g' | 'G')) => (&s[..i], 1 << 30),
            _ => (s, 1),
        };
        let value: u64 = digits.trim().parse().map_err(|_| {
            NestboxError::invalid(format!("invalid memory limit format: {input:?}"))
        })?;
        if value == 0 {
            return Err(NestboxError::invalid(format!(
                "memory limit must be positive: {input:?}"
            )));
        }
        value
            .checked_mul(multiplier)
            .map(Self::Bytes)
            .ok_or_else(|| NestboxError::invalid(format!("memory limit too large: {input:?}")))
    }

    /// Byte count, or `None` when unlimited.
    #[must_use]
    pub const fn bytes(&self) -> Option<u64> {
        match self {
            Self::Unlimited => None,
            Self::Bytes(b) => Some(*b),
        }
    }

    /// Value to write into `memory.max`.
    #[must_use]
    pub fn to_cgroup(&self) -> String {
        self.bytes()
            .map_or_else(|| KERNEL_MAX.to_string(), |b| b.to_string())
    }
}

impl fmt::Display for MemoryLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unlimited => f.write_str(UNLIMITED),
            Self::Bytes(b) => write!(f, "{b}"),
        }
    }
}

/// Translates a CPU limit string into `cpu.max` syntax.
///
/// # Errors
///
/// See [`CpuLimit::parse`].
pub fn cpu_limit_to_cgroup(input: &str) -> Result<String> {
    CpuLimit::parse(input).map(|l| l.to_cgroup())
}

/// Translates a memory limit string into a byte count (`None` = unlimited).
///
/// # Errors
///
/// See [`MemoryLimit::parse`].
pub fn memory_limit_to_bytes(input: &str) -> Result<Option<u64>> {
    MemoryLimit::parse(input).map(|l| l.bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_core_is_a_full_period() {
        assert_eq!(cpu_limit_to_cgroup("1").unwrap(), "100000 100000");
    }

    #[test]
    fn half_core_is_half_a_period() {
        assert_eq!(cpu_limit_to_cgroup("0.5").unwrap(), "50000 100000");
    }

    #[test]
    fn fractional_cores_round_to_nearest_microsecond() {
        assert_eq!(cpu_limit_to_cgroup("2.25").unwrap(), "225000 100000");
        assert_eq!(cpu_limit_to_cgroup("0.333333").unwrap(), "33333 100000");
    }

    #[test]
    fn unlimited_cpu_uses_kernel_sentinel() {
        assert_eq!(cpu_limit_to_cgroup("unlimited").unwrap(), "max 100000");
        assert_eq!(cpu_limit_to_cgroup("max").unwrap(), "max 100000");
    }

    #[test]
    fn cpu_rejects_garbage_and_non_positive() {
        assert!(cpu_limit_to_cgroup("abc").is_err());
        assert!(cpu_limit_to_cgroup("0").is_err());
        assert!(cpu_limit_to_cgroup("-1").is_err());
        assert!(cpu_limit_to_cgroup("NaN").is_err());
        assert!(cpu_limit_to_cgroup("0.001").is_err());
    }

    #[test]
    fn memory_suffixes_scale_by_1024() {
        assert_eq!(memory_limit_to_bytes("512M").unwrap(), Some(536_870_912));
        assert_eq!(memory_limit_to_bytes("1G").unwrap(), Some(1_073_741_824));
        assert_eq!(memory_limit_to_bytes("64k").unwrap(), Some(65_536));
        assert_eq!(memory_limit_to_bytes("4096").unwrap(), Some(4096));
    }

    #[test]
    fn unlimited_memory_has_no_byte_count() {
        assert_eq!(memory_limit_to_bytes("unlimited").unwrap(), None);
        assert_eq!(MemoryLimit::Unlimited.to_cgroup(), "max");
    }

    #[test]
    fn memory_rejects_bad_values() {
        assert!(memory_limit_to_bytes("").is_err());
        assert!(memory_limit_to_bytes("M").is_err());
        assert!(memory_limit_to_bytes("0M").is_err());
        assert!(memory_limit_to_bytes("1.5G").is_err());
        assert!(memory_limit_to_bytes("99999999999999G").is_err());
    }
}
