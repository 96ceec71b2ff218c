use super::{ProcessCollector, ProcessInfo};
use crate::error::{ProcessError, ProcessResult};
use std::fs;
use std::path::{Path, PathBuf};

/// Length at which the kernel truncates `comm`.
const COMM_LEN: usize = 15;

pub struct LinuxProcessCollector {
    clock_ticks: u64,
    boot_time: u64,
}

impl LinuxProcessCollector {
    pub fn new() -> Self {
        let clock_ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) as u64 }.max(1);
        let boot_time = Self::get_boot_time();
        Self {
            clock_ticks,
            boot_time,
        }
    }

    /// Fails when `/proc` cannot be enumerated at all.
    pub fn probe() -> std::io::Result<Self> {
        fs::read_dir("/proc")?;
        Ok(Self::new())
    }

    fn get_boot_time() -> u64 {
        let stat = fs::read_to_string("/proc/stat").unwrap_or_default();
        for line in stat.lines() {
            if let Some(rest) = line.strip_prefix("btime ") {
                return rest.trim().parse().unwrap_or(0);
            }
        }
        0
    }

    fn parse_process(&self, pid: u32) -> Option<ProcessInfo> {
        let proc_path = format!("/proc/{}", pid);
        let proc_dir = Path::new(&proc_path);

        let stat_content = fs::read_to_string(proc_dir.join("stat")).ok()?;
        // comm may contain spaces and parentheses; it ends at the last ')'
        let open = stat_content.find('(')?;
        let close = stat_content.rfind(')')?;
        let comm = stat_content.get(open + 1..close)?.to_string();
        let stat_parts: Vec<&str> = stat_content.get(close + 1..)?.split_whitespace().collect();
        // fields after comm start at field 3 (state)
        if stat_parts.len() < 20 {
            return None;
        }
        let start_time_ticks: u64 = stat_parts[19].parse().unwrap_or(0);
        let start_time = self.boot_time + (start_time_ticks / self.clock_ticks);

        let name = if comm.len() >= COMM_LEN {
            Self::exe_name(proc_dir).unwrap_or(comm)
        } else {
            comm
        };

        Some(ProcessInfo {
            pid,
            name,
            start_time,
        })
    }

    fn exe_name(proc_dir: &Path) -> Option<String> {
        let exe = fs::read_link(proc_dir.join("exe")).ok()?;
        exe.file_name().map(|n| n.to_string_lossy().into_owned())
    }
}

impl Default for LinuxProcessCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessCollector for LinuxProcessCollector {
    fn list_processes(&self) -> ProcessResult<Vec<ProcessInfo>> {
        let entries = fs::read_dir("/proc").map_err(|e| ProcessError::from_io(0, e))?;
        let mut processes = Vec::new();
        for entry in entries.flatten() {
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(pid) = name.parse::<u32>() {
                    if let Some(info) = self.parse_process(pid) {
                        processes.push(info);
                    }
                }
            }
        }
        Ok(processes)
    }

    fn get_process(&self, pid: u32) -> Option<ProcessInfo> {
        self.parse_process(pid)
    }

    fn resolve_path(&self, pid: u32) -> ProcessResult<PathBuf> {
        let link = fs::read_link(format!("/proc/{}/exe", pid))
            .map_err(|e| ProcessError::from_io(pid, e))?;
        // replaced binaries show up as "/path (deleted)"
        let text = link.to_string_lossy();
        match text.strip_suffix(" (deleted)") {
            Some(stripped) => Ok(PathBuf::from(stripped)),
            None => Ok(link),
        }
    }
}
