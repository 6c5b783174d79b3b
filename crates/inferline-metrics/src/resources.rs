//! Process resource sampling.

/// Resident set size of this process, in bytes.
///
/// Read from `/proc/self/statm`; `None` where procfs is unavailable.
pub fn read_rss_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    parse_statm(&statm, page_size())
}

#[cfg(unix)]
fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as u64 } else { 4096 }
}

#[cfg(not(unix))]
fn page_size() -> u64 {
    4096
}

/// Second field of statm is resident pages.
fn parse_statm(statm: &str, page_size: u64) -> Option<u64> {
    let resident: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident * page_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_resident_pages() {
        assert_eq!(parse_statm("5000 1200 300 10 0 900 0\n", 4096), Some(1200 * 4096));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_statm("", 4096), None);
        assert_eq!(parse_statm("12 abc", 4096), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn reads_own_rss() {
        let rss = read_rss_bytes().unwrap();
        assert!(rss > 0);
    }
}
