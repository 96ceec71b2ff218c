use super::{ExitWait, ProcessControl};
use crate::error::{ProcessError, ProcessResult};
use crate::rule::strategy::{full_mask, Priority};
use async_trait::async_trait;
use std::fs;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};
use tokio::io::unix::AsyncFd;
use tracing::{debug, trace};

const MAX_IOV: usize = 1024;
const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct LinuxProcessControl {
    num_cpus: u32,
}

impl LinuxProcessControl {
    pub fn new() -> Self {
        let num_cpus = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) }.max(1) as u32;
        Self { num_cpus }
    }

    /// Thread ids of `pid`. Nice values and affinity are per-thread on Linux.
    fn tasks(pid: u32) -> ProcessResult<Vec<u32>> {
        let entries = fs::read_dir(format!("/proc/{}/task", pid))
            .map_err(|e| ProcessError::from_io(pid, e))?;
        let tids: Vec<u32> = entries
            .flatten()
            .filter_map(|e| e.file_name().to_str().and_then(|s| s.parse().ok()))
            .collect();
        if tids.is_empty() {
            return Err(ProcessError::Exited(pid));
        }
        Ok(tids)
    }

    /// Apply `op` to every thread, tolerating threads that exit midway.
    fn for_each_task<F>(pid: u32, mut op: F) -> ProcessResult<()>
    where
        F: FnMut(u32) -> ProcessResult<()>,
    {
        let mut touched = 0usize;
        for tid in Self::tasks(pid)? {
            match op(tid) {
                Ok(()) => touched += 1,
                Err(e) if e.is_exited() && tid != pid => {
                    trace!(pid, tid, "thread exited during adjustment");
                }
                Err(ProcessError::Exited(_)) => return Err(ProcessError::Exited(pid)),
                Err(ProcessError::AccessDenied(_)) => return Err(ProcessError::AccessDenied(pid)),
                Err(e) => return Err(e),
            }
        }
        if touched == 0 {
            return Err(ProcessError::Exited(pid));
        }
        Ok(())
    }

    fn pidfd_open(pid: u32) -> ProcessResult<OwnedFd> {
        let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid as libc::pid_t, 0) };
        if fd < 0 {
            return Err(ProcessError::last_os_error(pid));
        }
        Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
    }

    /// Writable private mappings, as (start, length).
    fn private_regions(pid: u32) -> ProcessResult<Vec<(usize, usize)>> {
        let maps = fs::read_to_string(format!("/proc/{}/maps", pid))
            .map_err(|e| ProcessError::from_io(pid, e))?;
        let mut regions = Vec::new();
        for line in maps.lines() {
            let mut parts = line.split_whitespace();
            let (Some(range), Some(perms)) = (parts.next(), parts.next()) else {
                continue;
            };
            if !perms.contains('w') || !perms.ends_with('p') {
                continue;
            }
            let Some((start, end)) = range.split_once('-') else {
                continue;
            };
            let (Ok(start), Ok(end)) = (
                usize::from_str_radix(start, 16),
                usize::from_str_radix(end, 16),
            ) else {
                continue;
            };
            if end > start {
                regions.push((start, end - start));
            }
        }
        Ok(regions)
    }

    async fn poll_exit(&self, pid: u32, timeout: Duration) -> ExitWait {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !self.is_alive(pid) {
                return ExitWait::Exited;
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now()))).await;
        }
        if self.is_alive(pid) {
            ExitWait::TimedOut
        } else {
            ExitWait::Exited
        }
    }
}

impl Default for LinuxProcessControl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessControl for LinuxProcessControl {
    fn priority(&self, pid: u32) -> ProcessResult<Priority> {
        // -1 is a valid nice value, so errno must be cleared first
        let nice = unsafe {
            *libc::__errno_location() = 0;
            libc::getpriority(libc::PRIO_PROCESS, pid as libc::id_t)
        };
        if nice == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error().unwrap_or(0) != 0 {
                return Err(ProcessError::from_io(pid, err));
            }
        }
        Ok(Priority::from_nice(nice))
    }

    fn set_priority(&self, pid: u32, priority: Priority) -> ProcessResult<()> {
        let nice = priority.nice();
        Self::for_each_task(pid, |tid| {
            let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, tid as libc::id_t, nice) };
            if rc != 0 {
                return Err(ProcessError::last_os_error(tid));
            }
            Ok(())
        })
    }

    fn affinity(&self, pid: u32) -> ProcessResult<u64> {
        let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::sched_getaffinity(
                pid as libc::pid_t,
                std::mem::size_of::<libc::cpu_set_t>(),
                &mut set,
            )
        };
        if rc != 0 {
            return Err(ProcessError::last_os_error(pid));
        }
        let mut mask = 0u64;
        for cpu in 0..64usize {
            if unsafe { libc::CPU_ISSET(cpu, &set) } {
                mask |= 1 << cpu;
            }
        }
        Ok(mask)
    }

    fn set_affinity(&self, pid: u32, mask: u64) -> ProcessResult<()> {
        if mask == 0 {
            return Err(ProcessError::Io {
                pid,
                message: "refusing to write an empty affinity mask".into(),
            });
        }
        let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        unsafe { libc::CPU_ZERO(&mut set) };
        for cpu in 0..64usize {
            if mask & (1 << cpu) != 0 {
                unsafe { libc::CPU_SET(cpu, &mut set) };
            }
        }
        Self::for_each_task(pid, |tid| {
            let rc = unsafe {
                libc::sched_setaffinity(
                    tid as libc::pid_t,
                    std::mem::size_of::<libc::cpu_set_t>(),
                    &set,
                )
            };
            if rc != 0 {
                return Err(ProcessError::last_os_error(tid));
            }
            Ok(())
        })
    }

    fn trim_working_set(&self, pid: u32) -> ProcessResult<u64> {
        let regions = Self::private_regions(pid)?;
        if regions.is_empty() {
            return Ok(0);
        }
        let pidfd = Self::pidfd_open(pid)?;
        let raw = std::os::fd::AsRawFd::as_raw_fd(&pidfd);

        let mut advised = 0u64;
        for chunk in regions.chunks(MAX_IOV) {
            let iov: Vec<libc::iovec> = chunk
                .iter()
                .map(|&(start, len)| libc::iovec {
                    iov_base: start as *mut libc::c_void,
                    iov_len: len,
                })
                .collect();
            let rc = unsafe {
                libc::syscall(
                    libc::SYS_process_madvise,
                    raw,
                    iov.as_ptr(),
                    iov.len(),
                    libc::MADV_PAGEOUT,
                    0u32,
                )
            };
            if rc < 0 {
                let err = ProcessError::last_os_error(pid);
                if advised > 0 && !err.is_exited() {
                    // partial success still counts
                    debug!(pid, error = %err, "working set trim stopped early");
                    break;
                }
                return Err(err);
            }
            advised += rc as u64;
        }
        Ok(advised)
    }

    fn is_alive(&self, pid: u32) -> bool {
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        if rc != 0 && std::io::Error::last_os_error().raw_os_error() != Some(libc::EPERM) {
            return false;
        }
        // zombies still answer signals
        match fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.trim_start().chars().next())
                .map_or(false, |state| state != 'Z' && state != 'X'),
            Err(_) => false,
        }
    }

    fn all_cores(&self) -> u64 {
        full_mask(self.num_cpus.min(64))
    }

    async fn wait_for_exit(&self, pid: u32, timeout: Duration) -> ExitWait {
        let pidfd = match Self::pidfd_open(pid) {
            Ok(fd) => fd,
            Err(e) if e.is_exited() => return ExitWait::Exited,
            Err(e) => {
                trace!(pid, error = %e, "pidfd unavailable, polling for exit");
                return self.poll_exit(pid, timeout).await;
            }
        };
        let async_fd = match AsyncFd::new(pidfd) {
            Ok(fd) => fd,
            Err(e) => {
                trace!(pid, error = %e, "pidfd not pollable, polling for exit");
                return self.poll_exit(pid, timeout).await;
            }
        };
        match tokio::time::timeout(timeout, async_fd.readable()).await {
            Ok(Ok(_)) => ExitWait::Exited,
            Ok(Err(e)) => {
                trace!(pid, error = %e, "pidfd wait failed, polling for exit");
                self.poll_exit(pid, timeout).await
            }
            Err(_) => ExitWait::TimedOut,
        }
    }
}
