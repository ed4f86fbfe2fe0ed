//! Virtual network interface adapter (spec §4.5).
//!
//! `Handle` is a trait object over whatever async byte stream backs one TUN
//! device, so the rest of the crate (the data plane, the service state
//! machine) never needs to know whether it is talking to a real kernel
//! device or the in-memory loopback used in tests.

use crate::error::{Result, TunnelError};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// One complete IP frame worth of bytes moves per `read`/`write` call; the
/// caller is expected to size buffers at `mtu`.
pub struct Handle {
    io: Pin<Box<dyn TunIo>>,
    name: String,
    mtu: u16,
}

trait TunIo: AsyncRead + AsyncWrite + Send {}
impl<T: AsyncRead + AsyncWrite + Send + ?Sized> TunIo for T {}

impl Handle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Read exactly one IP frame into `buf` (must be at least `mtu` bytes).
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.io
            .as_mut()
            .read(buf)
            .await
            .map_err(|e| TunnelError::TunInterfaceDown(e.to_string()))
    }

    /// Write exactly one IP frame.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.io
            .as_mut()
            .write(buf)
            .await
            .map_err(|e| TunnelError::TunInterfaceDown(e.to_string()))
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.io
            .as_mut()
            .shutdown()
            .await
            .map_err(TunnelError::Io)
    }
}

/// Open (or create) a TUN device, bring it up, assign `address` (CIDR), and
/// set its MTU. `name` is a requested name; platforms that support
/// deterministic naming honor it so `reload` can detect collisions.
#[cfg(feature = "tun-device")]
pub fn open(name: Option<&str>, mtu: u16, address: &str) -> Result<Handle> {
    let mut config = tun::Configuration::default();
    config.mtu(mtu as i32).up();
    if let Some(name) = name {
        config.name(name);
    }
    if let Some((addr, prefix)) = parse_cidr(address) {
        config.address(addr).netmask(prefix_to_netmask(prefix));
    }

    let device = tun::create_as_async(&config).map_err(|e| match e {
        tun::Error::Io(ref io) if io.kind() == std::io::ErrorKind::PermissionDenied => {
            TunnelError::InterfaceUnavailable(format!("permission denied: {io}"))
        }
        other => TunnelError::TunOpenFailed(other.to_string()),
    })?;

    let actual_name = device
        .get_ref()
        .name()
        .map(|s| s.to_string())
        .unwrap_or_else(|_| name.unwrap_or("tun0").to_string());

    Ok(Handle {
        io: Box::pin(device),
        name: actual_name,
        mtu,
    })
}

#[cfg(feature = "tun-device")]
fn parse_cidr(cidr: &str) -> Option<(std::net::Ipv4Addr, u8)> {
    let (addr, prefix) = cidr.split_once('/')?;
    Some((addr.parse().ok()?, prefix.parse().ok()?))
}

#[cfg(feature = "tun-device")]
fn prefix_to_netmask(prefix: u8) -> std::net::Ipv4Addr {
    let mask: u32 = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix as u32)
    };
    std::net::Ipv4Addr::from(mask)
}

/// In-memory TUN device pair used by tests and by non-Linux/non-privileged
/// development builds (behind the inverse of `tun-device`). Two `Handle`s
/// share a pair of duplex pipes: writes to one are readable from the other,
/// exactly like a TUN device and its peer across the tunnel.
pub mod memory {
    use super::Handle;
    use tokio::io::duplex;

    pub fn pair(mtu: u16) -> (Handle, Handle) {
        let (a, b) = duplex(usize::from(mtu) * 4);
        (
            Handle {
                io: Box::pin(a),
                name: "tun-mem-a".to_string(),
                mtu,
            },
            Handle {
                io: Box::pin(b),
                name: "tun-mem-b".to_string(),
                mtu,
            },
        )
    }
}
