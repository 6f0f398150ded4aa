//! Process memory probing.
//!
//! Linux reads resident set size from `/proc/self/statm`; other platforms
//! report 0, which consumers treat as "unknown, not over limit".

/// Page size assumed when the kernel does not say otherwise.
const PAGE_SIZE_BYTES: u64 = 4096;

/// Current resident heap size of this process in bytes, or 0 when the
/// platform offers no cheap probe.
pub fn heap_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        read_statm_resident().unwrap_or(0)
    }
    #[cfg(not(target_os = "linux"))]
    {
        0
    }
}

#[cfg(target_os = "linux")]
fn read_statm_resident() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * PAGE_SIZE_BYTES)
}

/// Approximate system CPU utilization in percent, from the one-minute load
/// average scaled by core count. 0 when the platform offers no probe.
pub fn cpu_percent() -> u64 {
    #[cfg(target_os = "linux")]
    {
        read_loadavg_percent().unwrap_or(0)
    }
    #[cfg(not(target_os = "linux"))]
    {
        0
    }
}

#[cfg(target_os = "linux")]
fn read_loadavg_percent() -> Option<u64> {
    let loadavg = std::fs::read_to_string("/proc/loadavg").ok()?;
    let load_1m: f64 = loadavg.split_whitespace().next()?.parse().ok()?;
    let cores = std::thread::available_parallelism().map(|p| p.get()).unwrap_or(1);
    Some((load_1m / cores as f64 * 100.0).round() as u64)
}
