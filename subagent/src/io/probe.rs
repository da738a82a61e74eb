//! Process-level resource sampling for the monitor tick.

use crate::core::types::ResourceUsage;

/// Source of live usage numbers.
pub trait UsageProbe: Send + Sync {
    fn sample(&self) -> ResourceUsage;
}

/// Samples the current process from `/proc/self` on Linux.
///
/// Scopes share one process, so these are process-wide figures; the monitor
/// turns CPU time into a per-scope delta. Other platforms report zeros.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessUsageProbe;

/// Kernel clock ticks per second assumed for `/proc/self/stat`.
const CLOCK_TICKS_PER_SEC: u64 = 100;

impl UsageProbe for ProcessUsageProbe {
    #[cfg(target_os = "linux")]
    fn sample(&self) -> ResourceUsage {
        use std::fs;

        let memory_mb = fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|s| parse_rss_mb(&s))
            .unwrap_or(0);
        let cpu_time_ms = fs::read_to_string("/proc/self/stat")
            .ok()
            .and_then(|s| parse_cpu_time_ms(&s))
            .unwrap_or(0);
        let (file_handles, network_connections) = count_descriptors();
        ResourceUsage {
            memory_mb,
            cpu_time_ms,
            file_handles,
            network_connections,
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn sample(&self) -> ResourceUsage {
        ResourceUsage::default()
    }
}

/// Open descriptors and how many of them are sockets.
#[cfg(target_os = "linux")]
fn count_descriptors() -> (u64, u64) {
    let Ok(entries) = std::fs::read_dir("/proc/self/fd") else {
        return (0, 0);
    };
    let mut handles = 0;
    let mut sockets = 0;
    for entry in entries.flatten() {
        handles += 1;
        if let Ok(target) = std::fs::read_link(entry.path())
            && target.to_string_lossy().starts_with("socket:")
        {
            sockets += 1;
        }
    }
    (handles, sockets)
}

/// `VmRSS` from `/proc/<pid>/status`, in MB.
pub(crate) fn parse_rss_mb(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb / 1024)
}

/// `utime + stime` from `/proc/<pid>/stat`, in ms.
pub(crate) fn parse_cpu_time_ms(stat: &str) -> Option<u64> {
    // The command name may contain spaces; fields resume after the last ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some((utime + stime) * 1000 / CLOCK_TICKS_PER_SEC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rss_line() {
        let status = "Name:\tsubagent\nVmPeak:\t  9000 kB\nVmRSS:\t   20480 kB\n";
        assert_eq!(parse_rss_mb(status), Some(20));
        assert_eq!(parse_rss_mb("Name: x\n"), None);
    }

    #[test]
    fn parses_cpu_ticks_past_spaced_command_name() {
        let stat = "4242 (my (odd) cmd) S 1 4242 4242 0 -1 4194560 100 0 0 0 150 50 0 0 20 0 1 0";
        assert_eq!(parse_cpu_time_ms(stat), Some(2000));
        assert_eq!(parse_cpu_time_ms("garbage"), None);
    }
}
