//! Memory sizes and resident-set sampling for the memory footprint guard.
//!
//! Provides human-readable memory size parsing (e.g., "512M", "1.5G") and
//! a cheap way to read the current process RSS.

use std::fmt;
use std::str::FromStr;

/// Memory size in bytes with parsing and formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MemorySize(u64);

impl MemorySize {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create from mebibytes (MiB).
    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * 1024 * 1024)
    }

    pub const fn as_bytes(&self) -> u64 {
        self.0
    }

    /// Size in mebibytes (MiB), truncated.
    pub const fn as_mib(&self) -> u64 {
        self.0 / (1024 * 1024)
    }

    /// Size in gibibytes (GiB), truncated.
    pub const fn as_gib(&self) -> u64 {
        self.0 / (1024 * 1024 * 1024)
    }
}

/// Errors that can occur when parsing a memory size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// Invalid format in memory size string.
    InvalidFormat(String),
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidFormat(msg) => write!(f, "invalid memory size: {}", msg),
        }
    }
}

impl std::error::Error for MemoryError {}

impl FromStr for MemorySize {
    type Err = MemoryError;

    /// Parse a human-readable memory size string.
    ///
    /// Supported formats:
    /// - Plain number: treated as MiB (e.g., "512" = 512 MiB)
    /// - With suffix: "1G", "1GB", "1GiB", "512M", "512MB", "512MiB", "64K"
    /// - Case insensitive
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(MemoryError::InvalidFormat("empty string".into()));
        }

        let num_end = s
            .chars()
            .position(|c| !c.is_ascii_digit() && c != '.')
            .unwrap_or(s.len());

        if num_end == 0 {
            return Err(MemoryError::InvalidFormat(format!(
                "no numeric value in '{}'",
                s
            )));
        }

        let num_str = &s[..num_end];
        let suffix = s[num_end..].trim().to_lowercase();

        let value: f64 = num_str
            .parse()
            .map_err(|_| MemoryError::InvalidFormat(format!("invalid number: '{}'", num_str)))?;

        let multiplier: u64 = match suffix.as_str() {
            "" | "m" | "mb" | "mib" => 1024 * 1024,
            "b" => 1,
            "k" | "kb" | "kib" => 1024,
            "g" | "gb" | "gib" => 1024 * 1024 * 1024,
            _ => {
                return Err(MemoryError::InvalidFormat(format!(
                    "unknown suffix: '{}'",
                    suffix
                )));
            }
        };

        Ok(MemorySize((value * multiplier as f64) as u64))
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const GIB: u64 = 1024 * 1024 * 1024;

        if self.0 >= GIB {
            let gib = self.0 as f64 / GIB as f64;
            if gib.fract() < 0.01 {
                write!(f, "{} GiB", self.as_gib())
            } else {
                write!(f, "{:.1} GiB", gib)
            }
        } else if self.as_mib() > 0 {
            write!(f, "{} MiB", self.as_mib())
        } else {
            write!(f, "{} bytes", self.0)
        }
    }
}

/// Current resident set size of this process.
///
/// Reads `/proc/self/statm` on Linux (current RSS). Elsewhere falls back
/// to `getrusage()`, which reports the peak RSS instead.
pub fn resident_set_size() -> Option<MemorySize> {
    current_rss().or_else(peak_rss)
}

#[cfg(target_os = "linux")]
fn current_rss() -> Option<MemorySize> {
    use nix::unistd::{SysconfVar, sysconf};

    let contents = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = contents.split_whitespace().nth(1)?.parse().ok()?;
    let page_size = sysconf(SysconfVar::PAGE_SIZE).ok().flatten().unwrap_or(4096) as u64;
    Some(MemorySize::from_bytes(resident_pages * page_size))
}

#[cfg(not(target_os = "linux"))]
fn current_rss() -> Option<MemorySize> {
    None
}

fn peak_rss() -> Option<MemorySize> {
    use nix::sys::resource::{UsageWho, getrusage};

    let usage = getrusage(UsageWho::RUSAGE_SELF).ok()?;
    let max_rss = usage.max_rss().max(0) as u64;

    // macOS reports bytes, everything else kilobytes
    #[cfg(target_os = "macos")]
    let bytes = max_rss;
    #[cfg(not(target_os = "macos"))]
    let bytes = max_rss * 1024;

    Some(MemorySize::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_number_as_mib() {
        assert_eq!(MemorySize::from_str("512").unwrap().as_mib(), 512);
        assert_eq!(MemorySize::from_str("2048").unwrap().as_gib(), 2);
    }

    #[test]
    fn test_parse_with_suffix() {
        assert_eq!(MemorySize::from_str("2G").unwrap().as_gib(), 2);
        assert_eq!(MemorySize::from_str("2GiB").unwrap().as_gib(), 2);
        assert_eq!(MemorySize::from_str("300mb").unwrap().as_mib(), 300);
        assert_eq!(MemorySize::from_str("64K").unwrap().as_bytes(), 64 * 1024);
        assert_eq!(MemorySize::from_str("10b").unwrap().as_bytes(), 10);
    }

    #[test]
    fn test_parse_fractional() {
        assert_eq!(MemorySize::from_str("1.5G").unwrap().as_mib(), 1536);
    }

    #[test]
    fn test_parse_errors() {
        assert!(MemorySize::from_str("").is_err());
        assert!(MemorySize::from_str("lots").is_err());
        assert!(MemorySize::from_str("12X").is_err());
        assert!(MemorySize::from_str("-5G").is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(MemorySize::from_mib(8192).to_string(), "8 GiB");
        assert_eq!(MemorySize::from_mib(512).to_string(), "512 MiB");
        assert_eq!(MemorySize::from_mib(1536).to_string(), "1.5 GiB");
        assert_eq!(MemorySize::from_bytes(100).to_string(), "100 bytes");
    }

    #[test]
    fn test_resident_set_size_is_plausible() {
        let rss = resident_set_size().expect("rss should be readable");
        assert!(rss.as_bytes() > 0);
        assert!(rss.as_gib() < 64, "RSS too high: {}", rss);
    }
}
