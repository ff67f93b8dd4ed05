//! Linux procfs/sysfs readers.
//!
//! Every reader returns `None` when its source is missing or unparsable so
//! callers can degrade the dependent check instead of failing.

use std::path::Path;
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Block device cache (resolved once via OnceLock)
// ---------------------------------------------------------------------------

static BLOCK_DEVICES: OnceLock<Vec<String>> = OnceLock::new();

/// Whole-disk names from `/sys/block`, skipping loop and ram devices.
fn block_devices() -> &'static [String] {
    BLOCK_DEVICES.get_or_init(|| {
        let mut names: Vec<String> = std::fs::read_dir("/sys/block")
            .map(|entries| {
                entries
                    .flatten()
                    .filter_map(|e| e.file_name().into_string().ok())
                    .filter(|n| !n.starts_with("loop") && !n.starts_with("ram"))
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    })
}

// ---------------------------------------------------------------------------
// Public metric readers
// ---------------------------------------------------------------------------

/// Reads CPU idle and total jiffies from `/proc/stat`.
pub fn read_cpu_times() -> Option<(u64, u64)> {
    let content = std::fs::read_to_string("/proc/stat").ok()?;
    parse_cpu_line(content.lines().next()?)
}

/// Reads `MemAvailable` from `/proc/meminfo`, in bytes.
pub fn read_available_memory() -> Option<u64> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    content
        .lines()
        .find_map(|line| parse_meminfo_kb(line, "MemAvailable:"))
        .map(|kb| kb * 1024)
}

/// Free space on the filesystem holding `path`, as a percentage.
pub fn read_disk_free_percent(path: &Path) -> Option<f64> {
    let stat = nix::sys::statvfs::statvfs(path).ok()?;
    let total = stat.blocks() as f64;
    if total <= 0.0 {
        return None;
    }
    Some(stat.blocks_available() as f64 / total * 100.0)
}

/// Cumulative bytes received plus sent on all non-loopback interfaces.
pub fn read_network_bytes() -> Option<u64> {
    let content = std::fs::read_to_string("/proc/net/dev").ok()?;
    parse_net_dev(&content)
}

/// Cumulative bytes read plus written on whole disks.
pub fn read_disk_bytes() -> Option<u64> {
    let devices = block_devices();
    if devices.is_empty() {
        return None;
    }
    let content = std::fs::read_to_string("/proc/diskstats").ok()?;
    Some(parse_diskstats(&content, devices))
}

/// Established TCP connections (IPv4 and IPv6).
pub fn read_tcp_connections() -> Option<u32> {
    let mut found = false;
    let mut total = 0;
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        if let Ok(content) = std::fs::read_to_string(table) {
            found = true;
            total += count_established(&content);
        }
    }
    found.then_some(total)
}

/// Seconds since boot from `/proc/uptime`.
pub fn read_uptime_secs() -> Option<u64> {
    let content = std::fs::read_to_string("/proc/uptime").ok()?;
    let secs: f64 = content.split_whitespace().next()?.parse().ok()?;
    Some(secs as u64)
}

/// Peak resident set size of this process (`VmHWM`), in bytes.
pub fn read_peak_rss() -> Option<u64> {
    read_status_kb(Path::new("/proc/self/status"), "VmHWM:").map(|kb| kb * 1024)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Parses the aggregate `cpu` line into (idle, total) jiffies.
fn parse_cpu_line(line: &str) -> Option<(u64, u64)> {
    if !line.starts_with("cpu ") {
        return None;
    }
    // "cpu  user nice system idle iowait irq softirq steal guest guest_nice"
    // guest time is already included in user and nice.
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let idle = fields[3];
    let total = fields.iter().sum();
    Some((idle, total))
}

/// Parses a line from `/proc/meminfo` matching a prefix, returns value in kB.
fn parse_meminfo_kb(line: &str, prefix: &str) -> Option<u64> {
    line.strip_prefix(prefix)?
        .split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
}

fn read_status_kb(path: &Path, prefix: &str) -> Option<u64> {
    let content = std::fs::read_to_string(path).ok()?;
    content.lines().find_map(|l| parse_meminfo_kb(l, prefix))
}

/// Sums rx and tx byte columns of `/proc/net/dev`, skipping `lo`.
///
/// ```text
///  face |bytes    packets errs ... |bytes    packets ...
///  eth0: 1234     10      0    ...  5678     12      ...
/// ```
fn parse_net_dev(content: &str) -> Option<u64> {
    let mut total = 0u64;
    let mut seen = false;
    for line in content.lines().skip(2) {
        let Some((iface, data)) = line.split_once(':') else {
            continue;
        };
        if iface.trim() == "lo" {
            continue;
        }
        let cols: Vec<u64> = data
            .split_whitespace()
            .filter_map(|c| c.parse().ok())
            .collect();
        if cols.len() < 9 {
            continue;
        }
        total = total.saturating_add(cols[0]).saturating_add(cols[8]);
        seen = true;
    }
    seen.then_some(total)
}

/// Sums sectors read and written (512-byte units) for the given devices.
fn parse_diskstats(content: &str, devices: &[String]) -> u64 {
    content
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 10 || !devices.iter().any(|d| d == cols[2]) {
                return None;
            }
            let read: u64 = cols[5].parse().ok()?;
            let written: u64 = cols[9].parse().ok()?;
            Some((read + written) * 512)
        })
        .sum()
}

/// Counts rows in a `/proc/net/tcp` table whose state is `01` (ESTABLISHED).
fn count_established(content: &str) -> u32 {
    content
        .lines()
        .skip(1)
        .filter(|line| line.split_whitespace().nth(3) == Some("01"))
        .count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_cpu_times_returns_values() {
        let (idle, total) = read_cpu_times().expect("/proc/stat readable");
        assert!(total > 0, "total CPU jiffies should be > 0");
        assert!(idle <= total, "idle should be <= total");
    }

    #[test]
    fn read_available_memory_returns_value() {
        assert!(read_available_memory().is_some_and(|b| b > 0));
    }

    #[test]
    fn disk_free_percent_in_range() {
        let dir = tempfile::tempdir().unwrap();
        let pct = read_disk_free_percent(dir.path()).expect("statvfs on tempdir");
        assert!((0.0..=100.0).contains(&pct));
    }

    #[test]
    fn disk_free_percent_missing_path() {
        assert!(read_disk_free_percent(Path::new("/definitely/not/here")).is_none());
    }

    #[test]
    fn parse_cpu_line_valid() {
        assert_eq!(
            parse_cpu_line("cpu  100 0 50 800 10 0 0 0 0 0"),
            Some((800, 960))
        );
    }

    #[test]
    fn parse_cpu_line_ignores_guest_columns() {
        assert_eq!(
            parse_cpu_line("cpu  100 0 50 800 10 0 0 40 30 20"),
            Some((800, 1000))
        );
    }

    #[test]
    fn parse_cpu_line_rejects_per_core() {
        assert_eq!(parse_cpu_line("cpu0 1 2 3 4"), None);
        assert_eq!(parse_cpu_line("cpu  1 2"), None);
    }

    #[test]
    fn parse_meminfo_kb_valid() {
        assert_eq!(
            parse_meminfo_kb("MemAvailable:    8000000 kB", "MemAvailable:"),
            Some(8000000)
        );
        assert_eq!(parse_meminfo_kb("MemTotal: 1 kB", "MemAvailable:"), None);
    }

    #[test]
    fn parse_net_dev_skips_loopback() {
        let content = "Inter-|   Receive                                                |  Transmit\n \
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed\n    \
lo: 5000      10    0    0    0     0          0         0     5000      10    0    0    0     0       0          0\n  \
eth0: 1000      10    0    0    0     0          0         0      300       5    0    0    0     0       0          0\n";
        assert_eq!(parse_net_dev(content), Some(1300));
    }

    #[test]
    fn parse_net_dev_empty() {
        assert_eq!(parse_net_dev("header\nheader\n"), None);
    }

    #[test]
    fn parse_diskstats_whole_disks_only() {
        let content = "   8       0 sda 100 0 10 0 50 0 20 0 0 0 0\n   8       1 sda1 100 0 10 0 50 0 20 0 0 0 0\n";
        let devices = vec!["sda".to_string()];
        assert_eq!(parse_diskstats(content, &devices), 30 * 512);
    }

    #[test]
    fn count_established_rows() {
        let content = "  sl  local_address rem_address   st tx_queue rx_queue\n   \
0: 0100007F:0CEA 00000000:0000 0A 00000000:00000000\n   \
1: 0100007F:A1B2 0100007F:0CEA 01 00000000:00000000\n   \
2: 0100007F:A1B3 0100007F:0CEA 01 00000000:00000000\n";
        assert_eq!(count_established(content), 2);
    }

    #[test]
    fn read_status_kb_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status");
        std::fs::write(&path, "Name:\tx\nVmHWM:\t  2048 kB\n").unwrap();
        assert_eq!(read_status_kb(&path, "VmHWM:"), Some(2048));
    }
}
