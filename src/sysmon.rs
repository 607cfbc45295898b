//! Host and process sampling attached to responses.
//!
//! Best effort only: unsupported platforms report `None` and the sink falls
//! back to zero values on the wire.

/// 1-minute load average.
#[cfg(unix)]
pub fn load_average_1m() -> Option<f64> {
    let mut loads = [0f64; 1];
    let filled = unsafe { libc::getloadavg(loads.as_mut_ptr(), 1) };
    if filled == 1 {
        Some(loads[0])
    } else {
        None
    }
}

#[cfg(not(unix))]
pub fn load_average_1m() -> Option<f64> {
    None
}

/// Resident set size of the current process in bytes.
#[cfg(target_os = "linux")]
pub fn resident_memory_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }
    Some(resident_pages * page_size as u64)
}

#[cfg(not(target_os = "linux"))]
pub fn resident_memory_bytes() -> Option<u64> {
    None
}
