//! Kernel process-events connector (`CN_IDX_PROC`) as a push feed
//!
//! Requires `CAP_NET_ADMIN`. Without it the subscription fails at `start` and
//! the manager falls back to periodic scans alone.

use super::{NewProcessEvent, ProcessEventFeed};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CN_IDX_PROC: u32 = 1;
const CN_VAL_PROC: u32 = 1;
const PROC_CN_MCAST_LISTEN: u32 = 1;
const PROC_EVENT_EXEC: u32 = 0x0000_0002;

const NLMSG_HDR_LEN: usize = 16;
const CN_MSG_LEN: usize = 20;
const NLMSG_DONE: u16 = 3;
/// Offset of `proc_event.event_data` in a received datagram.
const EVENT_DATA_OFFSET: usize = NLMSG_HDR_LEN + CN_MSG_LEN + 16;

const RECV_TIMEOUT: Duration = Duration::from_millis(500);

pub struct NetlinkProcessFeed;

impl NetlinkProcessFeed {
    pub fn new() -> Self {
        Self
    }

    fn open_socket() -> io::Result<OwnedFd> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
                libc::NETLINK_CONNECTOR,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_pid = 0;
        addr.nl_groups = CN_IDX_PROC;
        let rc = unsafe {
            libc::bind(
                sock.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        let timeout = libc::timeval {
            tv_sec: 0,
            tv_usec: RECV_TIMEOUT.as_micros() as libc::suseconds_t,
        };
        let rc = unsafe {
            libc::setsockopt(
                sock.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &timeout as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(sock)
    }

    fn listen_message() -> Vec<u8> {
        let total = NLMSG_HDR_LEN + CN_MSG_LEN + 4;
        let mut buf = Vec::with_capacity(total);
        // nlmsghdr
        buf.extend_from_slice(&(total as u32).to_ne_bytes());
        buf.extend_from_slice(&NLMSG_DONE.to_ne_bytes());
        buf.extend_from_slice(&0u16.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(&std::process::id().to_ne_bytes());
        // cn_msg
        buf.extend_from_slice(&CN_IDX_PROC.to_ne_bytes());
        buf.extend_from_slice(&CN_VAL_PROC.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(&4u16.to_ne_bytes());
        buf.extend_from_slice(&0u16.to_ne_bytes());
        // payload
        buf.extend_from_slice(&PROC_CN_MCAST_LISTEN.to_ne_bytes());
        buf
    }

    fn subscribe(sock: &OwnedFd) -> io::Result<()> {
        let msg = Self::listen_message();
        let rc = unsafe {
            libc::send(
                sock.as_raw_fd(),
                msg.as_ptr() as *const libc::c_void,
                msg.len(),
                0,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
        buf.get(offset..offset + 4)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_ne_bytes)
    }

    /// Extract the pid of an exec event for a thread-group leader.
    fn parse_exec(buf: &[u8]) -> Option<u32> {
        let what = Self::read_u32(buf, NLMSG_HDR_LEN + CN_MSG_LEN)?;
        if what != PROC_EVENT_EXEC {
            return None;
        }
        let pid = Self::read_u32(buf, EVENT_DATA_OFFSET)?;
        let tgid = Self::read_u32(buf, EVENT_DATA_OFFSET + 4)?;
        (pid == tgid).then_some(pid)
    }

    fn run(sock: OwnedFd, tx: mpsc::UnboundedSender<NewProcessEvent>, cancel: CancellationToken) {
        let mut buf = vec![0u8; 4096];
        while !cancel.is_cancelled() {
            let n = unsafe {
                libc::recv(
                    sock.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) | Some(libc::EINTR) => continue,
                    Some(libc::ENOBUFS) => {
                        warn!("process event feed overflowed, some launches were missed");
                        continue;
                    }
                    _ => {
                        error!("process event feed failed: {}", err);
                        return;
                    }
                }
            }
            if let Some(pid) = Self::parse_exec(&buf[..n as usize]) {
                if tx.send(NewProcessEvent::pid_only(pid)).is_err() {
                    debug!("process event receiver dropped");
                    return;
                }
            }
        }
        debug!("process event feed stopped");
    }
}

impl Default for NetlinkProcessFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessEventFeed for NetlinkProcessFeed {
    fn start(
        &self,
        tx: mpsc::UnboundedSender<NewProcessEvent>,
        cancel: CancellationToken,
    ) -> io::Result<()> {
        let sock = Self::open_socket()?;
        Self::subscribe(&sock)?;
        std::thread::Builder::new()
            .name("proc-events".into())
            .spawn(move || Self::run(sock, tx, cancel))?;
        info!("Subscribed to kernel process events");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_message_layout() {
        let msg = NetlinkProcessFeed::listen_message();
        assert_eq!(msg.len(), 40);
        assert_eq!(NetlinkProcessFeed::read_u32(&msg, 0), Some(40));
        assert_eq!(NetlinkProcessFeed::read_u32(&msg, 16), Some(CN_IDX_PROC));
        assert_eq!(NetlinkProcessFeed::read_u32(&msg, 36), Some(PROC_CN_MCAST_LISTEN));
    }

    #[test]
    fn parses_exec_events_for_leaders_only() {
        let mut buf = vec![0u8; EVENT_DATA_OFFSET + 8];
        buf[36..40].copy_from_slice(&PROC_EVENT_EXEC.to_ne_bytes());
        buf[EVENT_DATA_OFFSET..EVENT_DATA_OFFSET + 4].copy_from_slice(&42u32.to_ne_bytes());
        buf[EVENT_DATA_OFFSET + 4..].copy_from_slice(&42u32.to_ne_bytes());
        assert_eq!(NetlinkProcessFeed::parse_exec(&buf), Some(42));

        // a thread exec'ing reports tgid != pid
        buf[EVENT_DATA_OFFSET + 4..].copy_from_slice(&41u32.to_ne_bytes());
        assert_eq!(NetlinkProcessFeed::parse_exec(&buf), None);

        buf[36..40].copy_from_slice(&1u32.to_ne_bytes());
        assert_eq!(NetlinkProcessFeed::parse_exec(&buf), None);
    }
}
