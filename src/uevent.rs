use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{
    bind, recv, socket, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType,
};

/// Listener on the kernel's device-event multicast groups.
///
/// Sleeping on this socket instead of a plain timer means a hot-plugged
/// device gets its IRQs balanced right away instead of after the long
/// interval runs out.
pub struct UeventSocket {
    fd: OwnedFd,
}

impl UeventSocket {
    pub fn open() -> nix::Result<Self> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Datagram,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkKObjectUEvent,
        )?;
        bind(fd.as_raw_fd(), &NetlinkAddr::new(0, u32::MAX))?;
        Ok(UeventSocket { fd })
    }

    /// Blocks for up to `interval`, returning early on a device uevent
    /// or a signal. Message contents don't matter; the next iteration
    /// rediscovers everything anyway.
    pub fn wait(&self, interval: Duration) {
        let millis = i32::try_from(interval.as_millis()).unwrap_or(i32::MAX);
        let timeout = PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX);
        let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, timeout) {
            Ok(0) => {}
            Ok(_) => {
                debug!("woken by device uevent");
                self.drain();
            }
            Err(Errno::EINTR) => {}
            Err(e) => warn!("uevent poll failed: {e}"),
        }
    }

    fn drain(&self) {
        let mut buf = [0u8; 4096];
        loop {
            match recv(self.fd.as_raw_fd(), &mut buf, MsgFlags::MSG_DONTWAIT) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(_) => break,
            }
        }
    }
}

/// The inter-iteration sleep. Uses the uevent socket when the kernel
/// lets us have one, otherwise a plain timer.
pub enum Sleeper {
    Uevent(UeventSocket),
    Plain,
}

impl Sleeper {
    pub fn new() -> Self {
        match UeventSocket::open() {
            Ok(socket) => Sleeper::Uevent(socket),
            Err(e) => {
                warn!("can't listen for device uevents, using plain sleep: {e}");
                Sleeper::Plain
            }
        }
    }

    pub fn sleep(&self, interval: Duration) {
        match self {
            Sleeper::Uevent(socket) => socket.wait(interval),
            Sleeper::Plain => thread::sleep(interval),
        }
    }
}
