//! Linux TAP device: open `/dev/net/tun`, attach it as a tap interface, and
//! pump frames to/from the stack's rings on dedicated blocking threads.
//!
//! The `ioctl` plumbing (`ifreq`, `TUNSETIFF`, `SIOCGIFMTU`) is carried over
//! from the teacher's `phy::sys::linux` constants and
//! `TuntapInterfaceDesc`, adapted from a poll-driven `RxToken`/`TxToken`
//! device into a pair of blocking pump threads feeding [`crate::ring::Ring`]s,
//! per the thread-per-subsystem concurrency model.

use std::fs::File;
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::FromRawFd;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, warn};

use crate::ring::{Frame, Ring};

mod sys {
    pub const IFF_TAP: libc::c_int = 0x0002;
    pub const IFF_NO_PI: libc::c_int = 0x1000;
    pub const SIOCGIFMTU: libc::c_ulong = 0x8921;

    pub const TUNSETIFF: libc::c_ulong = if cfg!(any(
        target_arch = "mips",
        all(target_arch = "mips", target_endian = "little"),
        target_arch = "mips64",
        all(target_arch = "mips64", target_endian = "little"),
        target_arch = "powerpc",
        target_arch = "powerpc64",
        all(target_arch = "powerpc64", target_endian = "little"),
        target_arch = "sparc64"
    )) {
        0x800454CA
    } else {
        0x400454CA
    };
}

fn ifreq_for(name: &str) -> io::Result<libc::ifreq> {
    if name.len() >= libc::IF_NAMESIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "interface name too long",
        ));
    }
    let mut ifr = unsafe { MaybeUninit::<libc::ifreq>::zeroed().assume_init() };
    for (i, byte) in name.as_bytes().iter().enumerate() {
        ifr.ifr_name[i] = *byte as libc::c_char;
    }
    Ok(ifr)
}

fn ifreq_ioctl(fd: libc::c_int, ifr: &mut libc::ifreq, cmd: libc::c_ulong) -> io::Result<libc::c_int> {
    let res = unsafe { libc::ioctl(fd, cmd as _, ifr as *mut libc::ifreq) };
    if res == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(res)
}

fn control_socket() -> io::Result<File> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, libc::IPPROTO_IP);
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(File::from_raw_fd(fd))
    }
}

/// A blocking handle to a Linux TAP device.
pub struct TunTapDevice {
    fd: libc::c_int,
    mtu: usize,
}

impl AsRawFd for TunTapDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl TunTapDevice {
    /// Open `/dev/net/tun`, attach it as interface `name` in tap mode, and
    /// read back its MTU.
    pub fn open(name: &str) -> io::Result<TunTapDevice> {
        let fd = unsafe { libc::open(c"/dev/net/tun".as_ptr(), libc::O_RDWR) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }

        let mut ifr = ifreq_for(name)?;
        unsafe {
            ifr.ifr_ifru.ifru_flags = (sys::IFF_TAP | sys::IFF_NO_PI) as libc::c_short;
        }
        ifreq_ioctl(fd, &mut ifr, sys::TUNSETIFF)?;

        let ctl = control_socket()?;
        let mtu = ifreq_ioctl(ctl.as_raw_fd(), &mut ifr, sys::SIOCGIFMTU)? as usize;

        Ok(TunTapDevice { fd, mtu })
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    fn recv(&self, buffer: &mut [u8]) -> io::Result<usize> {
        let len = unsafe { libc::read(self.fd, buffer.as_mut_ptr().cast(), buffer.len()) };
        if len == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(len as usize)
    }

    fn send(&self, buffer: &[u8]) -> io::Result<usize> {
        let len = unsafe { libc::write(self.fd, buffer.as_ptr().cast(), buffer.len()) };
        if len == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(len as usize)
    }

    /// Spawn the two pump threads: one blocking `read()` loop feeding
    /// `rx_ring`, one blocking `write()` loop draining `tx_ring`.
    pub fn spawn_pumps(
        self: Arc<Self>,
        rx_ring: Arc<Ring>,
        tx_ring: Arc<Ring>,
    ) -> (JoinHandle<()>, JoinHandle<()>) {
        let rx_device = Arc::clone(&self);
        let rx_handle = thread::spawn(move || {
            let mut buffer = vec![0u8; rx_device.mtu().max(1500) + 64];
            loop {
                match rx_device.recv(&mut buffer) {
                    Ok(0) => break,
                    Ok(len) => rx_ring.enqueue(Frame::new(buffer[..len].to_vec()), false),
                    Err(err) => {
                        warn!("tap device read failed: {err}");
                        break;
                    }
                }
            }
        });

        let tx_device = self;
        let tx_handle = thread::spawn(move || {
            while let Some(frame) = tx_ring.dequeue() {
                if let Err(err) = tx_device.send(&frame.bytes) {
                    warn!("tap device write failed (tracker={}): {err}", frame.tracker);
                } else {
                    debug!("tap device wrote frame tracker={}", frame.tracker);
                }
            }
        });

        (rx_handle, tx_handle)
    }
}

impl Drop for TunTapDevice {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
