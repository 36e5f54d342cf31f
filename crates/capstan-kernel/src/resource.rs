//! Host resource pre-flight.
//!
//! Before a capability body runs, the executor samples a [`ResourceProbe`]
//! and compares the snapshot against [`ResourceLimits`].  A reading above a
//! configured threshold refuses the call with
//! [`CapError::ResourceExhausted`]; a reading the probe cannot provide is
//! treated as within limits.

use std::path::PathBuf;

use async_trait::async_trait;
use capstan_types::CapError;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Point-in-time host utilisation, in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSnapshot {
    pub memory_used_percent: Option<f64>,
    pub disk_used_percent: Option<f64>,
}

/// Upper bounds checked before each execution.  `None` disables a check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub max_memory_percent: Option<f64>,
    pub max_disk_percent: Option<f64>,
}

impl ResourceLimits {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_memory_percent.is_none() && self.max_disk_percent.is_none()
    }

    /// Compare `snapshot` against the configured bounds.
    ///
    /// # Errors
    ///
    /// [`CapError::ResourceExhausted`] naming the first exceeded resource.
    pub fn check(&self, snapshot: &ResourceSnapshot) -> Result<(), CapError> {
        let checks = [
            ("memory", snapshot.memory_used_percent, self.max_memory_percent),
            ("disk", snapshot.disk_used_percent, self.max_disk_percent),
        ];
        for (resource, reading, limit) in checks {
            if let (Some(reading), Some(limit)) = (reading, limit)
                && reading > limit
            {
                return Err(CapError::ResourceExhausted(format!(
                    "{resource} usage {reading:.1}% exceeds limit {limit:.1}%"
                )));
            }
        }
        Ok(())
    }
}

/// Source of [`ResourceSnapshot`]s.
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    fn name(&self) -> &str;

    async fn sample(&self) -> ResourceSnapshot;
}

// ────────────────────────────────────────────────────────────────────────────
// ProcfsProbe
// ────────────────────────────────────────────────────────────────────────────

/// Reads memory pressure from a Linux `meminfo` file.
///
/// Disk usage is not reported.
pub struct ProcfsProbe {
    meminfo: PathBuf,
}

impl Default for ProcfsProbe {
    fn default() -> Self {
        Self {
            meminfo: PathBuf::from("/proc/meminfo"),
        }
    }
}

impl ProcfsProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read from `path` instead of `/proc/meminfo`.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            meminfo: path.into(),
        }
    }
}

#[async_trait]
impl ResourceProbe for ProcfsProbe {
    fn name(&self) -> &str {
        "procfs"
    }

    async fn sample(&self) -> ResourceSnapshot {
        let memory_used_percent = match tokio::fs::read_to_string(&self.meminfo).await {
            Ok(raw) => parse_meminfo(&raw),
            Err(e) => {
                debug!(path = %self.meminfo.display(), error = %e, "meminfo unavailable");
                None
            }
        };
        ResourceSnapshot {
            memory_used_percent,
            disk_used_percent: None,
        }
    }
}

/// Used-memory percentage from `MemTotal` and `MemAvailable`.
pub fn parse_meminfo(raw: &str) -> Option<f64> {
    let field = |name: &str| -> Option<f64> {
        raw.lines()
            .find_map(|line| line.strip_prefix(name))
            .and_then(|rest| rest.trim_start_matches(':').split_whitespace().next())
            .and_then(|kb| kb.parse::<f64>().ok())
    };
    let total = field("MemTotal")?;
    let available = field("MemAvailable")?;
    if total <= 0.0 {
        return None;
    }
    Some(((total - available) / total * 100.0).clamp(0.0, 100.0))
}

// ────────────────────────────────────────────────────────────────────────────
// StaticProbe
// ────────────────────────────────────────────────────────────────────────────

/// Always returns the same snapshot.  The default reports nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticProbe(pub ResourceSnapshot);

#[async_trait]
impl ResourceProbe for StaticProbe {
    fn name(&self) -> &str {
        "static"
    }

    async fn sample(&self) -> ResourceSnapshot {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MEMINFO: &str = "MemTotal:       16000000 kB\nMemFree:         1000000 kB\nMemAvailable:    4000000 kB\n";

    #[test]
    fn parses_used_percentage() {
        assert_eq!(parse_meminfo(MEMINFO), Some(75.0));
    }

    #[test]
    fn missing_fields_yield_none() {
        assert_eq!(parse_meminfo("MemTotal: 100 kB\n"), None);
        assert_eq!(parse_meminfo(""), None);
    }

    #[test]
    fn limits_flag_the_exceeded_resource() {
        let limits = ResourceLimits {
            max_memory_percent: Some(80.0),
            max_disk_percent: Some(90.0),
        };
        let busy = ResourceSnapshot {
            memory_used_percent: Some(50.0),
            disk_used_percent: Some(95.0),
        };
        let err = limits.check(&busy).unwrap_err();
        assert!(matches!(err, CapError::ResourceExhausted(ref m) if m.starts_with("disk")));

        let idle = ResourceSnapshot {
            memory_used_percent: Some(10.0),
            disk_used_percent: None,
        };
        assert!(limits.check(&idle).is_ok());
    }

    #[test]
    fn unbounded_limits_accept_anything() {
        let limits = ResourceLimits::unbounded();
        assert!(limits.is_unbounded());
        let full = ResourceSnapshot {
            memory_used_percent: Some(100.0),
            disk_used_percent: Some(100.0),
        };
        assert!(limits.check(&full).is_ok());
    }

    #[tokio::test]
    async fn procfs_probe_reads_custom_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MEMINFO.as_bytes()).unwrap();
        let probe = ProcfsProbe::with_path(file.path());
        let snap = probe.sample().await;
        assert_eq!(snap.memory_used_percent, Some(75.0));
        assert_eq!(snap.disk_used_percent, None);
    }

    #[tokio::test]
    async fn procfs_probe_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let probe = ProcfsProbe::with_path(dir.path().join("nope"));
        assert_eq!(probe.sample().await, ResourceSnapshot::default());
    }
}
