//! Kernel uevent listener.
//!
//! A raw netlink socket bound to the kobject-uevent multicast group feeds
//! the event bus. Datagrams are NUL-separated `KEY=value` lists; the
//! `SEQNUM` property is stripped before re-injection into containers so
//! the in-guest sequence numbering stays consistent.

use crate::constants::{UEVENT_BUFFER_SIZE, UEVENT_MULTICAST_GROUP};
use crate::device::ObservedUsb;
use crate::error::{Error, Result};
use nix::sys::socket::{
    bind, recv, socket, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType,
};
use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use tokio::io::unix::AsyncFd;
use tracing::debug;

// =============================================================================
// Parsing
// =============================================================================

/// A parsed uevent datagram.
#[derive(Debug, Clone, Default)]
pub struct Uevent {
    pub props: HashMap<String, String>,
    /// The original NUL-separated parts, minus `SEQNUM`, for injection.
    pub parts: Vec<String>,
    /// Byte length of the injectable payload.
    pub len: usize,
}

impl Uevent {
    pub fn get(&self, key: &str) -> &str {
        self.props.get(key).map(String::as_str).unwrap_or("")
    }

    /// Serializes back into the NUL-separated wire form for injection.
    pub fn payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                out.push(0);
            }
            out.extend_from_slice(part.as_bytes());
        }
        out
    }
}

/// Parses a raw uevent buffer into properties and injectable parts.
pub fn parse_uevent(buf: &[u8]) -> Uevent {
    let mut event = Uevent::default();

    for part in buf.split(|b| *b == 0) {
        if part.is_empty() {
            continue;
        }
        let part = String::from_utf8_lossy(part).to_string();
        if part.starts_with("SEQNUM=") {
            continue;
        }

        event.len += part.len() + 1;
        if let Some((key, value)) = part.split_once('=') {
            event.props.insert(key.to_string(), value.to_string());
        }
        event.parts.push(part);
    }

    event.len = event.len.saturating_sub(1);
    event
}

// =============================================================================
// Classification
// =============================================================================

/// Decisions the event bus derives from one uevent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UeventClass {
    /// A CPU went online or offline; rebalance pinning.
    Cpu { name: String, online: bool },
    /// A network interface appeared or went away.
    Net { iface: String, added: bool },
    /// A USB device was added or removed.
    Usb {
        added: bool,
        observed: ObservedUsb,
        payload: Vec<u8>,
    },
}

/// Classifies a parsed uevent, returning `None` for subsystems the bus
/// does not track.
pub fn classify_uevent(event: &Uevent) -> Option<UeventClass> {
    match event.get("SUBSYSTEM") {
        "cpu" => {
            if event.get("DRIVER") != "processor" {
                return None;
            }
            let online = match event.get("ACTION") {
                "online" => true,
                "offline" => false,
                _ => return None,
            };
            let name = event
                .get("DEVPATH")
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string();
            Some(UeventClass::Cpu { name, online })
        }
        "net" => {
            let added = match event.get("ACTION") {
                "add" => true,
                "remove" | "removed" => false,
                _ => return None,
            };
            let iface = event.get("INTERFACE").to_string();
            if iface.is_empty() {
                return None;
            }
            Some(UeventClass::Net { iface, added })
        }
        "usb" => {
            let added = match event.get("ACTION") {
                "add" => true,
                "remove" => false,
                _ => return None,
            };

            // PRODUCT is "vendor/product/bcd" with unpadded hex fields.
            let product_raw = event.get("PRODUCT");
            let mut product_fields = product_raw.split('/');
            let vendor = product_fields.next()?;
            let product = product_fields.next()?;

            let major: u32 = event.get("MAJOR").parse().ok()?;
            let minor: u32 = event.get("MINOR").parse().ok()?;
            let busnum: u32 = event.get("BUSNUM").parse().ok()?;
            let devnum: u32 = event.get("DEVNUM").parse().ok()?;

            let mut observed = ObservedUsb::from_bus_address(vendor, product, busnum, devnum);
            observed.major = major;
            observed.minor = minor;
            if !event.get("DEVNAME").is_empty() {
                let devname = event.get("DEVNAME");
                observed.path = if devname.starts_with('/') {
                    devname.into()
                } else {
                    format!("/dev/{devname}").into()
                };
            }

            Some(UeventClass::Usb {
                added,
                observed,
                payload: event.payload(),
            })
        }
        _ => None,
    }
}

// =============================================================================
// Socket
// =============================================================================

/// Async reader over the kobject-uevent netlink socket.
pub struct UeventSocket {
    fd: AsyncFd<OwnedFd>,
}

impl UeventSocket {
    /// Opens and binds the multicast socket.
    pub fn open() -> Result<Self> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            SockProtocol::NetlinkKObjectUEvent,
        )?;

        let addr = NetlinkAddr::new(std::process::id(), UEVENT_MULTICAST_GROUP);
        bind(fd.as_raw_fd(), &addr)?;

        let fd = AsyncFd::new(fd).map_err(Error::Io)?;
        debug!("uevent netlink socket bound");
        Ok(UeventSocket { fd })
    }

    /// Receives and parses the next uevent.
    pub async fn next_event(&self) -> Result<Uevent> {
        let mut buf = vec![0u8; UEVENT_BUFFER_SIZE * 2];
        loop {
            let mut guard = self.fd.readable().await.map_err(Error::Io)?;
            match recv(self.fd.get_ref().as_raw_fd(), &mut buf, MsgFlags::empty()) {
                Ok(n) => return Ok(parse_uevent(&buf[..n])),
                Err(nix::errno::Errno::EAGAIN) => {
                    guard.clear_ready();
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
