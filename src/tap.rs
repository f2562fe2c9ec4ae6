//! Tap endpoint lifecycle and frame I/O.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Mutex;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::net::if_::if_nametoindex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::state::{InterfaceId, RouterId, VlanId};

/// Tap device flags from linux/if_tun.h
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;

/// ioctl request code for TUNSETIFF
const TUNSETIFF: libc::c_ulong = 0x400454ca;

/// ifreq structure for tap device configuration
#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22], // padding to match kernel struct size
}

/// Result of one non-blocking frame read.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A full frame of the given length was read.
    Frame(usize),
    /// No frame available right now.
    WouldBlock,
    /// The device returned end-of-file.
    Eof,
}

/// One kernel tap device fronting a single VLAN.
///
/// The device carries raw L2 frames (no packet-info prefix) and is opened
/// non-blocking so the ingress pump can multiplex many endpoints behind one
/// readiness waiter. The fd is held precisely while the endpoint is live;
/// `close` is idempotent.
pub struct TapEndpoint {
    name: String,
    file: Mutex<Option<File>>,
    ifindex: u32,
    interface: InterfaceId,
    router: RouterId,
    vlan: VlanId,
}

impl TapEndpoint {
    /// Create the tap device and bring it into non-blocking L2 mode.
    ///
    /// The requested name is truncated to the kernel's interface-name limit;
    /// the kernel-assigned interface index is recorded after creation.
    pub fn open(
        name: &str,
        router: RouterId,
        interface: InterfaceId,
        vlan: VlanId,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")
            .map_err(Error::KernelIo)?;

        let mut ifr = IfReq {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: IFF_TAP | IFF_NO_PI,
            _pad: [0; 22],
        };

        let mut truncated = String::with_capacity(name.len());
        for (i, byte) in name.bytes().enumerate() {
            if i >= libc::IFNAMSIZ - 1 {
                break;
            }
            ifr.ifr_name[i] = byte as libc::c_char;
            truncated.push(byte as char);
        }

        let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &ifr) };
        if rc < 0 {
            return Err(Error::KernelIo(io::Error::last_os_error()));
        }

        let flags = fcntl(file.as_raw_fd(), FcntlArg::F_GETFL).map_err(io::Error::from)?;
        let new_flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(file.as_raw_fd(), FcntlArg::F_SETFL(new_flags)).map_err(io::Error::from)?;

        let ifindex = if_nametoindex(truncated.as_str()).map_err(io::Error::from)?;

        info!(name = %truncated, ifindex, vlan = %vlan, "tap endpoint created");

        Ok(Self {
            name: truncated,
            file: Mutex::new(Some(file)),
            ifindex,
            interface,
            router,
            vlan,
        })
    }

    /// Adopt an already-open tap fd (e.g. one passed in by a supervisor).
    ///
    /// The caller is responsible for the device being in L2, no-packet-info,
    /// non-blocking mode.
    pub fn from_file(
        file: File,
        name: String,
        ifindex: u32,
        router: RouterId,
        interface: InterfaceId,
        vlan: VlanId,
    ) -> Self {
        Self {
            name,
            file: Mutex::new(Some(file)),
            ifindex,
            interface,
            router,
            vlan,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    pub fn interface_id(&self) -> InterfaceId {
        self.interface
    }

    pub fn router_id(&self) -> RouterId {
        self.router
    }

    pub fn vlan(&self) -> VlanId {
        self.vlan
    }

    /// Raw fd for readiness registration, while the endpoint is live.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.lock_file().as_ref().map(|f| f.as_raw_fd())
    }

    pub fn is_open(&self) -> bool {
        self.lock_file().is_some()
    }

    /// Read at most one frame into `buf`.
    ///
    /// A closed endpoint reads as end-of-file. Hard errors are returned to
    /// the caller; would-block is a normal outcome in non-blocking mode.
    pub fn read_frame(&self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        let guard = self.lock_file();
        let Some(file) = guard.as_ref() else {
            return Ok(ReadOutcome::Eof);
        };
        let mut file: &File = file;
        match file.read(buf) {
            Ok(0) => Ok(ReadOutcome::Eof),
            Ok(n) => Ok(ReadOutcome::Frame(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
            Err(e) => Err(e),
        }
    }

    /// Write one full frame to the device.
    pub fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        let guard = self.lock_file();
        let Some(file) = guard.as_ref() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "tap endpoint is closed",
            ));
        };
        let mut file: &File = file;
        let written = file.write(frame)?;
        if written != frame.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "short write to tap device",
            ));
        }
        Ok(())
    }

    /// Release the device fd. Idempotent.
    pub fn close(&self) {
        let mut guard = self.lock_file();
        if guard.take().is_some() {
            info!(name = %self.name, "tap endpoint closed");
        } else {
            debug!(name = %self.name, "tap endpoint already closed");
        }
    }

    fn lock_file(&self) -> std::sync::MutexGuard<'_, Option<File>> {
        self.file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for TapEndpoint {
    fn drop(&mut self) {
        debug!(name = %self.name, "tap endpoint released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::OwnedFd;

    fn pipe_endpoint() -> (TapEndpoint, OwnedFd) {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        let endpoint = TapEndpoint::from_file(
            File::from(read_end),
            "tap1".to_string(),
            42,
            RouterId(0),
            InterfaceId(1),
            VlanId(1),
        );
        (endpoint, write_end)
    }

    #[test]
    fn test_read_frame_returns_frame() {
        let (endpoint, write_end) = pipe_endpoint();
        nix::unistd::write(&write_end, &[0xab; 60]).unwrap();
        let mut buf = [0u8; 2048];
        match endpoint.read_frame(&mut buf).unwrap() {
            ReadOutcome::Frame(len) => {
                assert_eq!(len, 60);
                assert_eq!(&buf[..4], &[0xab; 4]);
            }
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn test_read_frame_eof_after_writer_closes() {
        let (endpoint, write_end) = pipe_endpoint();
        drop(write_end);
        let mut buf = [0u8; 64];
        assert_eq!(endpoint.read_frame(&mut buf).unwrap(), ReadOutcome::Eof);
    }

    #[test]
    fn test_read_frame_would_block_on_empty_nonblocking_fd() {
        let (endpoint, _write_end) = pipe_endpoint();
        let fd = endpoint.raw_fd().unwrap();
        let flags = fcntl(fd, FcntlArg::F_GETFL).unwrap();
        fcntl(
            fd,
            FcntlArg::F_SETFL(OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK),
        )
        .unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(
            endpoint.read_frame(&mut buf).unwrap(),
            ReadOutcome::WouldBlock
        );
    }

    #[test]
    fn test_close_is_idempotent() {
        let (endpoint, _write_end) = pipe_endpoint();
        assert!(endpoint.is_open());
        endpoint.close();
        assert!(!endpoint.is_open());
        assert!(endpoint.raw_fd().is_none());
        endpoint.close();
        let mut buf = [0u8; 16];
        assert_eq!(endpoint.read_frame(&mut buf).unwrap(), ReadOutcome::Eof);
        assert!(endpoint.write_frame(&[0u8; 16]).is_err());
    }
}
