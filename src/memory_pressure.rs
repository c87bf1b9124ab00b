//! System memory sampling and debounced memory-pressure warnings.
//!
//! Readings come from:
//!
//! 1. **Available memory**: `/proc/meminfo` MemAvailable (MemTotal for sizing)
//! 2. **PSI (Pressure Stall Information)**: `/proc/pressure/memory` on Linux 4.20+
//!
//! The pool polls a [`MemoryPressureMonitor`] from its event loop; the monitor
//! turns a high reading into at most one warning per debounce interval.

use std::fs;
use std::time::{Duration, Instant};

/// Available memory (MiB) below which the system is under pressure.
const DEFAULT_MIN_AVAILABLE_MIB: u64 = 2 * 1024;

/// PSI "some" threshold (percentage) for considering memory under pressure.
const PSI_SOME_THRESHOLD: f64 = 25.0;

/// Minimum spacing between two samples taken by a monitor.
const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Assumed installed memory when it cannot be read.
const FALLBACK_SYSTEM_MEMORY_MIB: u64 = 8 * 1024;

/// Memory pressure state.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryPressure {
    /// Available memory in MiB.
    pub available_mib: u64,
    /// PSI "some" percentage (0-100), if available.
    pub psi_some: Option<f64>,
    /// PSI "full" percentage (0-100), if available.
    pub psi_full: Option<f64>,
}

impl MemoryPressure {
    /// A reading with plenty of headroom.
    pub fn relaxed() -> Self {
        Self {
            available_mib: u64::MAX,
            psi_some: None,
            psi_full: None,
        }
    }

    /// Critical: available < 1 GiB or PSI full > 50%.
    pub fn is_critical(&self) -> bool {
        self.available_mib < 1024 || self.psi_full.is_some_and(|p| p > 50.0)
    }

    /// High: available < 2 GiB or PSI some > 25%.
    pub fn is_high(&self) -> bool {
        self.available_mib < DEFAULT_MIN_AVAILABLE_MIB
            || self.psi_some.is_some_and(|p| p > PSI_SOME_THRESHOLD)
    }
}

/// Read the current memory pressure from the kernel.
pub fn current_memory_pressure() -> MemoryPressure {
    let available_mib = fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|contents| parse_meminfo(&contents).available_mib)
        .unwrap_or(u64::MAX);
    let (psi_some, psi_full) = fs::read_to_string("/proc/pressure/memory")
        .map(|contents| parse_psi(&contents))
        .unwrap_or((None, None));

    MemoryPressure {
        available_mib,
        psi_some,
        psi_full,
    }
}

/// Installed memory in MiB, used to size caches.
pub fn system_memory_mib() -> u64 {
    fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|contents| parse_meminfo(&contents).total_mib)
        .unwrap_or(FALLBACK_SYSTEM_MEMORY_MIB)
}

#[derive(Debug, Default, PartialEq, Eq)]
struct MemInfo {
    total_mib: Option<u64>,
    available_mib: Option<u64>,
}

/// Parse `/proc/meminfo`. Falls back to MemFree + Buffers + Cached on kernels
/// without MemAvailable.
fn parse_meminfo(contents: &str) -> MemInfo {
    let mut info = MemInfo::default();
    let mut mem_free = 0u64;
    let mut buffers = 0u64;
    let mut cached = 0u64;

    for line in contents.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 {
            continue;
        }
        // Format: "MemAvailable:    12345678 kB"
        let kb: u64 = parts[1].parse().unwrap_or(0);
        match parts[0] {
            "MemTotal:" => info.total_mib = Some(kb / 1024),
            "MemAvailable:" => info.available_mib = Some(kb / 1024),
            "MemFree:" => mem_free = kb,
            "Buffers:" => buffers = kb,
            "Cached:" => cached = kb,
            _ => {}
        }
    }

    if info.available_mib.is_none() && mem_free > 0 {
        info.available_mib = Some((mem_free + buffers + cached) / 1024);
    }
    info
}

/// Parse `/proc/pressure/memory` avg10 values as (some, full).
///
/// ```text
/// some avg10=0.00 avg60=0.00 avg300=0.00 total=123456
/// full avg10=0.00 avg60=0.00 avg300=0.00 total=123456
/// ```
fn parse_psi(contents: &str) -> (Option<f64>, Option<f64>) {
    let mut some_pct = None;
    let mut full_pct = None;

    for line in contents.lines() {
        let avg10 = line
            .split_whitespace()
            .find_map(|p| p.strip_prefix("avg10="))
            .and_then(|v| v.parse::<f64>().ok());

        if line.starts_with("some ") {
            some_pct = avg10;
        } else if line.starts_with("full ") {
            full_pct = avg10;
        }
    }

    (some_pct, full_pct)
}

type Sampler = Box<dyn Fn() -> MemoryPressure>;

/// Turns memory readings into debounced warnings.
pub struct MemoryPressureMonitor {
    sampler: Sampler,
    debounce: Duration,
    last_sample: Option<Instant>,
    last_warning: Option<Instant>,
    under_pressure: bool,
}

impl MemoryPressureMonitor {
    /// Monitor backed by the kernel's readings.
    pub fn system(debounce: Duration) -> Self {
        Self::with_sampler(debounce, current_memory_pressure)
    }

    pub fn with_sampler(debounce: Duration, sampler: impl Fn() -> MemoryPressure + 'static) -> Self {
        Self {
            sampler: Box::new(sampler),
            debounce,
            last_sample: None,
            last_warning: None,
            under_pressure: false,
        }
    }

    /// Whether the latest sample was high.
    pub fn is_under_pressure(&self) -> bool {
        self.under_pressure
    }

    /// Sample if due. Returns `Some(critical)` when a warning should be raised.
    pub fn poll(&mut self, now: Instant) -> Option<bool> {
        if let Some(last) = self.last_sample
            && now.saturating_duration_since(last) < SAMPLE_INTERVAL
        {
            return None;
        }
        self.last_sample = Some(now);

        let pressure = (self.sampler)();
        self.under_pressure = pressure.is_high();
        if !self.under_pressure {
            return None;
        }

        if let Some(last) = self.last_warning
            && now.saturating_duration_since(last) < self.debounce
        {
            return None;
        }
        self.last_warning = Some(now);
        tracing::info!(
            available_mib = pressure.available_mib,
            psi_some = ?pressure.psi_some,
            critical = pressure.is_critical(),
            "Memory pressure detected"
        );
        Some(pressure.is_critical())
    }
}

impl std::fmt::Debug for MemoryPressureMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPressureMonitor")
            .field("debounce", &self.debounce)
            .field("under_pressure", &self.under_pressure)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_parse_meminfo() {
        let contents = "MemTotal:       16384000 kB\nMemFree:         1000000 kB\nMemAvailable:    4096000 kB\n";
        let info = parse_meminfo(contents);
        assert_eq!(info.total_mib, Some(16000));
        assert_eq!(info.available_mib, Some(4000));
    }

    #[test]
    fn test_parse_meminfo_fallback() {
        let contents = "MemTotal: 2048000 kB\nMemFree: 102400 kB\nBuffers: 102400 kB\nCached: 102400 kB\nSwapCached: 999 kB\n";
        let info = parse_meminfo(contents);
        assert_eq!(info.available_mib, Some(300));
    }

    #[test]
    fn test_parse_psi() {
        let contents = "some avg10=31.50 avg60=2.00 avg300=0.00 total=1\nfull avg10=0.25 avg60=0.00 avg300=0.00 total=1\n";
        assert_eq!(parse_psi(contents), (Some(31.5), Some(0.25)));
        assert_eq!(parse_psi(""), (None, None));
    }

    #[test]
    fn test_memory_pressure_levels() {
        let critical = MemoryPressure {
            available_mib: 500,
            psi_some: Some(30.0),
            psi_full: Some(60.0),
        };
        assert!(critical.is_critical());
        assert!(critical.is_high());

        assert!(!MemoryPressure::relaxed().is_high());
    }

    #[test]
    fn test_system_memory_is_reasonable() {
        let mib = system_memory_mib();
        assert!(mib >= 64);
    }

    #[test]
    fn test_monitor_debounces_warnings() {
        let available = Rc::new(Cell::new(512u64));
        let reading = available.clone();
        let mut monitor = MemoryPressureMonitor::with_sampler(Duration::from_secs(5), move || {
            MemoryPressure {
                available_mib: reading.get(),
                psi_some: None,
                psi_full: None,
            }
        });

        let start = Instant::now();
        assert_eq!(monitor.poll(start), Some(true));
        // Too soon to sample again.
        assert_eq!(monitor.poll(start + Duration::from_millis(100)), None);
        // Sampled, but still inside the debounce window.
        assert_eq!(monitor.poll(start + Duration::from_secs(1)), None);
        assert!(monitor.is_under_pressure());
        assert_eq!(monitor.poll(start + Duration::from_secs(6)), Some(true));

        available.set(100_000);
        assert_eq!(monitor.poll(start + Duration::from_secs(20)), None);
        assert!(!monitor.is_under_pressure());
    }
}
