//! Resident-memory probe
//!
//! The training batcher samples resident set size between batches and
//! backs off while above its soft ceiling. On Linux this reads
//! `/proc/self/statm`; elsewhere the probe reports `None` and the
//! ceiling check is skipped.

/// Resident set size of the current process in bytes, if measurable.
pub fn resident_memory_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        // statm fields are in pages; the second field is the resident set.
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(resident_pages * page_size())
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    // _SC_PAGESIZE without reaching for libc: the kernel ABI fixes 4 KiB
    // pages on every architecture this runs on in practice.
    4096
}
