/// Memory sampling for a running script tree
///
/// With a cgroup the kernel accounts the whole tree. Without one, the
/// supervisor sums resident memory over every process in the script's
/// session, which setsid() in the child makes unique to the run.
use crate::exec::cgroup::MemoryCgroup;

/// Session scans walk /proc, so they run every few ticks only
const SESSION_SCAN_EVERY: u32 = 5;

pub enum MemorySource<'a> {
    Cgroup(&'a MemoryCgroup),
    Session(i32),
}

impl MemorySource<'_> {
    /// Current memory of the whole script tree in bytes
    pub fn sample(&self) -> Option<u64> {
        match self {
            MemorySource::Cgroup(cgroup) => cgroup.current(),
            MemorySource::Session(session) => session_rss(*session),
        }
    }

    /// Supervisor ticks between samples
    pub fn interval(&self) -> u32 {
        match self {
            MemorySource::Cgroup(_) => 1,
            MemorySource::Session(_) => SESSION_SCAN_EVERY,
        }
    }
}

/// Summed RSS of every process whose session id is `session`
pub fn session_rss(session: i32) -> Option<u64> {
    let page_size = u64::try_from(unsafe { libc::sysconf(libc::_SC_PAGESIZE) }).ok()?;
    let mut total_pages = 0u64;
    let mut members = 0usize;
    for entry in std::fs::read_dir("/proc").ok()?.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().filter(|n| n.bytes().all(|b| b.is_ascii_digit())) else {
            continue;
        };
        // Processes exit between readdir and read
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
            continue;
        };
        if let Some((sid, pages)) = parse_stat(&stat) {
            if sid == session {
                total_pages = total_pages.saturating_add(pages);
                members += 1;
            }
        }
    }
    (members > 0).then(|| total_pages.saturating_mul(page_size))
}

/// (session id, rss pages) from a /proc/<pid>/stat line
fn parse_stat(stat: &str) -> Option<(i32, u64)> {
    // comm may contain spaces and parentheses; fields resume after the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // rest starts at field 3 (state): session is field 6, rss field 24
    let session = fields.get(3)?.parse().ok()?;
    let rss = fields.get(21)?.parse().ok()?;
    Some((session, rss))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stat_with_awkward_comm() {
        let stat = "4242 (evil) comm) S 1 4242 4242 0 -1 4194560 100 0 0 0 1 0 0 0 20 0 1 0 \
                    500 10000000 321 18446744073709551615 1 1 0 0 0 0 0 0 0 0 0 0 17 3 0 0 0 0 0";
        assert_eq!(parse_stat(stat), Some((4242, 321)));
        assert_eq!(parse_stat("4242 (truncated"), None);
    }

    #[test]
    fn own_session_has_resident_memory() {
        let session = unsafe { libc::getsid(0) };
        assert!(session_rss(session).unwrap_or(0) > 0);
        assert_eq!(session_rss(-7), None);
    }
}
