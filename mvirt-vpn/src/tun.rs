//! TUN device handle for the VPN ingestion path
//!
//! Opens a Layer 3 TUN device in blocking mode, or adopts a descriptor that
//! was set up elsewhere (e.g. handed over by a privileged helper). The reader
//! only reads from the device and closes it by dropping it.

use nix::libc;
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// TUN device flags from linux/if_tun.h
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

/// ioctl request code for TUNSETIFF
const TUNSETIFF: libc::c_ulong = 0x400454ca;

/// ifreq structure for TUN device configuration
#[derive(Debug)]
#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22], // padding to match kernel struct size
}

impl IfReq {
    fn new(name: &str, flags: libc::c_short) -> io::Result<Self> {
        let name_bytes = name.as_bytes();
        if name_bytes.is_empty() || name_bytes.len() >= libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid TUN device name: {name:?}"),
            ));
        }

        let mut ifr = IfReq {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: flags,
            _pad: [0; 22],
        };
        for (i, &b) in name_bytes.iter().enumerate() {
            ifr.ifr_name[i] = b as libc::c_char;
        }
        Ok(ifr)
    }
}

/// Readable TUN device carrying raw IP packets
pub struct TunDevice {
    name: String,
    file: File,
}

impl TunDevice {
    /// Open (or create) the TUN device `name`.
    ///
    /// The device is opened blocking with IFF_NO_PI, so every read returns
    /// exactly one bare IP packet.
    pub fn open(name: &str) -> io::Result<Self> {
        let ifr = IfReq::new(name, IFF_TUN | IFF_NO_PI)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")?;

        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        tracing::info!(name, "TUN device opened");

        Ok(Self {
            name: name.to_string(),
            file,
        })
    }

    /// Adopt an already configured TUN descriptor.
    pub fn from_fd(fd: OwnedFd, name: &str) -> Self {
        Self {
            name: name.to_string(),
            file: File::from(fd),
        }
    }

    /// Get the device name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bring the TUN interface up (SIOCSIFFLAGS with IFF_UP).
    ///
    /// Addresses and routes are left to the host configuration.
    pub fn bring_up(&self) -> io::Result<()> {
        let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if sock < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock_guard = SockGuard(sock);

        let mut ifr = IfReq::new(&self.name, 0)?;

        let ret = unsafe { libc::ioctl(sock_guard.0, libc::SIOCGIFFLAGS as _, &mut ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        ifr.ifr_flags |= libc::IFF_UP as libc::c_short;

        let ret = unsafe { libc::ioctl(sock_guard.0, libc::SIOCSIFFLAGS as _, &ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        tracing::info!(name = %self.name, "Interface set UP");
        Ok(())
    }
}

impl AsFd for TunDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl AsRawFd for TunDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl Read for TunDevice {
    /// Read one IP packet (blocks until one is available).
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

/// RAII guard for socket fd
struct SockGuard(RawFd);

impl Drop for SockGuard {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}
