//! Process accounting: where resource usage samples come from.
//!
//! `AccountingReader` is the seam between enforcement logic and the OS.
//! `ProcAccountingReader` reads Linux procfs; other platforms or tests
//! supply their own reader.

use crate::config::types::{Result, SupervisorError};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// One resource usage sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub pid: i32,
    pub cpu_time_seconds: f64,
    /// Filled in by the manager from consecutive samples
    pub cpu_percent: f64,
    pub memory_virtual_bytes: u64,
    pub memory_rss_bytes: u64,
    pub memory_peak_bytes: u64,
    pub file_descriptors_open: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub nice_value: i32,
    pub start_time: SystemTime,
    pub last_update: SystemTime,
}

impl Default for ResourceUsage {
    fn default() -> Self {
        let now = SystemTime::now();
        Self {
            pid: -1,
            cpu_time_seconds: 0.0,
            cpu_percent: 0.0,
            memory_virtual_bytes: 0,
            memory_rss_bytes: 0,
            memory_peak_bytes: 0,
            file_descriptors_open: 0,
            bytes_read: 0,
            bytes_written: 0,
            nice_value: 0,
            start_time: now,
            last_update: now,
        }
    }
}

/// Source of resource usage samples
pub trait AccountingReader: Send + Sync + std::fmt::Debug {
    /// Short identifier for logs and status dumps
    fn backend_name(&self) -> &'static str;

    /// Sample `pid`. Errors mean the process is gone or unreadable.
    fn sample(&self, pid: i32) -> Result<ResourceUsage>;

    /// Whether `pid` has exited but not yet been reaped
    fn is_zombie(&self, _pid: i32) -> bool {
        false
    }
}

/// Fields of `/proc/<pid>/stat` we care about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFields {
    pub state: char,
    pub utime_ticks: u64,
    pub stime_ticks: u64,
    pub nice: i32,
    pub vsize_bytes: u64,
    pub rss_pages: u64,
}

fn stat_field<'a>(fields: &[&'a str], n: usize) -> Result<&'a str> {
    // fields[0] is field 3 (state) of proc(5)
    fields
        .get(n - 3)
        .copied()
        .ok_or_else(|| SupervisorError::Process(format!("stat field {} missing", n)))
}

fn stat_number<T: std::str::FromStr>(fields: &[&str], n: usize) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    stat_field(fields, n)?
        .parse::<T>()
        .map_err(|e| SupervisorError::Process(format!("stat field {}: {}", n, e)))
}

/// Parse one `/proc/<pid>/stat` line.
///
/// The command name is parenthesised and may contain spaces or ')', so
/// fields are split after the last ')'.
pub fn parse_stat(content: &str) -> Result<StatFields> {
    let close = content
        .rfind(')')
        .ok_or_else(|| SupervisorError::Process("malformed stat: no ')'".to_string()))?;
    let fields: Vec<&str> = content[close + 1..].split_whitespace().collect();

    Ok(StatFields {
        state: stat_field(&fields, 3)?.chars().next().unwrap_or('?'),
        utime_ticks: stat_number(&fields, 14)?,
        stime_ticks: stat_number(&fields, 15)?,
        nice: stat_number(&fields, 19)?,
        vsize_bytes: stat_number(&fields, 23)?,
        rss_pages: stat_number(&fields, 24)?,
    })
}

/// Value of a `Key:   123 kB` line in `/proc/<pid>/status`, in bytes
pub fn parse_status_kb(content: &str, key: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let rest = line.strip_prefix(key)?.strip_prefix(':')?;
        let kb = rest.split_whitespace().next()?.parse::<u64>().ok()?;
        Some(kb * 1024)
    })
}

/// (rchar, wchar) from `/proc/<pid>/io`
pub fn parse_io(content: &str) -> (u64, u64) {
    let mut read = 0;
    let mut written = 0;
    for line in content.lines() {
        if let Some((key, value)) = line.split_once(':') {
            let value = value.trim().parse::<u64>().unwrap_or(0);
            match key {
                "rchar" => read = value,
                "wchar" => written = value,
                _ => {}
            }
        }
    }
    (read, written)
}

/// Linux procfs reader
#[derive(Debug, Clone)]
pub struct ProcAccountingReader {
    clock_ticks: u64,
    page_size: u64,
}

impl ProcAccountingReader {
    pub fn new() -> Self {
        use nix::unistd::{sysconf, SysconfVar};
        let clock_ticks = sysconf(SysconfVar::CLK_TCK)
            .ok()
            .flatten()
            .filter(|v| *v > 0)
            .map_or(100, |v| v as u64);
        let page_size = sysconf(SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .filter(|v| *v > 0)
            .map_or(4096, |v| v as u64);
        Self {
            clock_ticks,
            page_size,
        }
    }

    fn read_stat(&self, pid: i32) -> Result<StatFields> {
        let content = std::fs::read_to_string(format!("/proc/{}/stat", pid))
            .map_err(|e| SupervisorError::NotFound(format!("process {}: {}", pid, e)))?;
        parse_stat(&content)
    }
}

impl Default for ProcAccountingReader {
    fn default() -> Self {
        Self::new()
    }
}

impl AccountingReader for ProcAccountingReader {
    fn backend_name(&self) -> &'static str {
        "procfs"
    }

    fn sample(&self, pid: i32) -> Result<ResourceUsage> {
        if pid <= 0 {
            return Err(SupervisorError::NotFound(format!("invalid pid {}", pid)));
        }
        let stat = self.read_stat(pid)?;
        let mut usage = ResourceUsage {
            pid,
            cpu_time_seconds: (stat.utime_ticks + stat.stime_ticks) as f64
                / self.clock_ticks as f64,
            memory_virtual_bytes: stat.vsize_bytes,
            memory_rss_bytes: stat.rss_pages * self.page_size,
            nice_value: stat.nice,
            ..ResourceUsage::default()
        };

        // status carries the high-water mark; fall back to stat values
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            if let Some(v) = parse_status_kb(&status, "VmSize") {
                usage.memory_virtual_bytes = v;
            }
            if let Some(v) = parse_status_kb(&status, "VmRSS") {
                usage.memory_rss_bytes = v;
            }
            usage.memory_peak_bytes =
                parse_status_kb(&status, "VmHWM").unwrap_or(usage.memory_rss_bytes);
        }

        if let Ok(entries) = std::fs::read_dir(format!("/proc/{}/fd", pid)) {
            usage.file_descriptors_open = entries.count() as u64;
        }

        // Only readable for our own processes
        if let Ok(io) = std::fs::read_to_string(format!("/proc/{}/io", pid)) {
            let (read, written) = parse_io(&io);
            usage.bytes_read = read;
            usage.bytes_written = written;
        }

        Ok(usage)
    }

    fn is_zombie(&self, pid: i32) -> bool {
        matches!(self.read_stat(pid), Ok(stat) if stat.state == 'Z' || stat.state == 'X')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "4242 (my (odd) cmd) S 1 4242 4242 0 -1 4194560 120 0 0 0 \
        250 50 0 0 20 5 1 0 12345 10485760 300 18446744073709551615 1 1 0 0 0 0 0 0 0 0 0 0 17 3 0 0 0 0 0";

    #[test]
    fn test_parse_stat_handles_parens_in_name() {
        let stat = parse_stat(STAT).unwrap();
        assert_eq!(stat.state, 'S');
        assert_eq!(stat.utime_ticks, 250);
        assert_eq!(stat.stime_ticks, 50);
        assert_eq!(stat.nice, 5);
        assert_eq!(stat.vsize_bytes, 10485760);
        assert_eq!(stat.rss_pages, 300);
    }

    #[test]
    fn test_parse_stat_rejects_garbage() {
        assert!(parse_stat("no parens here").is_err());
        assert!(parse_stat("1 (x) S 1 2").is_err());
    }

    #[test]
    fn test_parse_status_kb() {
        let status = "Name:\tsleep\nVmPeak:\t  9000 kB\nVmSize:\t  8000 kB\nVmHWM:\t 700 kB\nVmRSS:\t 600 kB\n";
        assert_eq!(parse_status_kb(status, "VmSize"), Some(8000 * 1024));
        assert_eq!(parse_status_kb(status, "VmRSS"), Some(600 * 1024));
        assert_eq!(parse_status_kb(status, "VmHWM"), Some(700 * 1024));
        assert_eq!(parse_status_kb(status, "VmSwap"), None);
    }

    #[test]
    fn test_parse_io() {
        let io = "rchar: 100\nwchar: 42\nsyscr: 3\nread_bytes: 0\n";
        assert_eq!(parse_io(io), (100, 42));
    }

    #[test]
    fn test_sample_self() {
        let reader = ProcAccountingReader::new();
        let usage = reader.sample(std::process::id() as i32).unwrap();
        assert!(usage.memory_virtual_bytes > 0);
        assert!(usage.memory_rss_bytes > 0);
        assert!(usage.file_descriptors_open >= 3);
        assert!(!reader.is_zombie(std::process::id() as i32));
        assert_eq!(reader.backend_name(), "procfs");
    }

    #[test]
    fn test_sample_missing_process() {
        let reader = ProcAccountingReader::new();
        assert!(reader.sample(0).is_err());
        assert!(reader.sample(i32::MAX).is_err());
    }
}
