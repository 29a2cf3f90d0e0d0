//! Process resource usage from `getrusage(2)`

use std::time::Duration;

/// CPU time and resident size of the current process
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceUsage {
    /// User plus system CPU time
    pub cpu_time: Duration,
    /// Peak resident set size in bytes
    pub resident_bytes: u64,
}

fn timeval(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

/// Sample the current process. Returns zeros if the call fails.
pub fn current() -> ResourceUsage {
    // SAFETY: rusage is plain data and getrusage only writes into it
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return ResourceUsage::default();
    }

    // ru_maxrss is in bytes on Apple platforms, kilobytes elsewhere
    let maxrss = usage.ru_maxrss.max(0) as u64;
    let resident_bytes = if cfg!(any(target_os = "macos", target_os = "ios")) {
        maxrss
    } else {
        maxrss * 1024
    };

    ResourceUsage {
        cpu_time: timeval(usage.ru_utime) + timeval(usage.ru_stime),
        resident_bytes,
    }
}

/// CPU percentage used between two samples taken `wall` apart
pub fn cpu_percent(before: &ResourceUsage, after: &ResourceUsage, wall: Duration) -> f64 {
    if wall.is_zero() {
        return 0.0;
    }
    let used = after.cpu_time.saturating_sub(before.cpu_time);
    used.as_secs_f64() / wall.as_secs_f64() * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_reports_usage() {
        let usage = current();
        assert!(usage.resident_bytes > 0);
    }

    #[test]
    fn test_cpu_percent() {
        let before = ResourceUsage {
            cpu_time: Duration::from_millis(100),
            resident_bytes: 0,
        };
        let after = ResourceUsage {
            cpu_time: Duration::from_millis(600),
            resident_bytes: 0,
        };
        assert_eq!(cpu_percent(&before, &after, Duration::from_secs(1)), 50.0);
        assert_eq!(cpu_percent(&after, &before, Duration::from_secs(1)), 0.0);
        assert_eq!(cpu_percent(&before, &after, Duration::ZERO), 0.0);
    }
}
