use std::{
    fs::OpenOptions,
    net::IpAddr,
    os::fd::AsRawFd,
};

use anyhow::Context;
use futures::TryStreamExt;
use log::{debug, warn};
use netlink_packet_route::link::LinkMessage;
use nix::libc;
use tokio::runtime::Runtime;

use super::LinkManager;

const TUN_DEVICE: &str = "/dev/net/tun";
const TUNSETIFF: libc::Ioctl = 0x400454ca as libc::Ioctl;
const TUNSETPERSIST: libc::Ioctl = 0x400454cb as libc::Ioctl;

#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _padding: [u8; 22],
}

/// TAP devices over `/dev/net/tun` and rtnetlink.
///
/// rtnetlink is async; every call is driven to completion on a private
/// current-thread runtime so callers stay synchronous.
pub struct NetlinkLinks {
    runtime: Runtime,
}

impl NetlinkLinks {
    pub fn new() -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to build netlink runtime")?;

        Ok(Self { runtime })
    }

    fn create_tap(&self, name: &str) -> anyhow::Result<()> {
        if name.len() >= libc::IFNAMSIZ {
            anyhow::bail!("Device name {name} exceeds {} bytes", libc::IFNAMSIZ - 1);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(TUN_DEVICE)
            .with_context(|| format!("Failed to open {TUN_DEVICE}"))?;

        let mut ifr = IfReq {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short,
            _padding: [0; 22],
        };
        for (i, byte) in name.bytes().enumerate() {
            ifr.ifr_name[i] = byte as libc::c_char;
        }

        let ifr_ptr = &mut ifr as *mut IfReq;
        let result = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, ifr_ptr) };
        if result < 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("TUNSETIFF failed for {name}"));
        }

        // Keep the device once our descriptor closes.
        let persist: libc::c_ulong = 1;
        let result = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETPERSIST, persist) };
        if result < 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("TUNSETPERSIST failed for {name}"));
        }

        Ok(())
    }

    /// Removes a device this adapter just created. Returns whether it is gone.
    fn roll_back(&self, name: &str) -> bool {
        match self.runtime.block_on(self.delete_link(name)) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to roll back tap device {name}: {e:#}");
                false
            }
        }
    }

    async fn set_address(&self, name: &str, mac: [u8; 6]) -> anyhow::Result<()> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);

        let link = self.get_link_by_name(name, &handle).await?;
        handle
            .link()
            .set(link.header.index)
            .address(mac.to_vec())
            .execute()
            .await?;

        Ok(())
    }

    async fn add_ip(&self, name: &str, ip: IpAddr, prefix_len: u8) -> anyhow::Result<()> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);

        let link = self.get_link_by_name(name, &handle).await?;
        handle
            .address()
            .add(link.header.index, ip, prefix_len)
            .execute()
            .await?;

        Ok(())
    }

    async fn delete_link(&self, name: &str) -> anyhow::Result<()> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);

        let link = self.get_link_by_name(name, &handle).await?;
        handle.link().del(link.header.index).execute().await?;

        Ok(())
    }

    async fn get_link_by_name(
        &self,
        name: &str,
        handle: &rtnetlink::Handle,
    ) -> anyhow::Result<LinkMessage> {
        handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute()
            .try_next()
            .await?
            .ok_or(anyhow::anyhow!("Link {name} not found"))
    }
}

impl LinkManager for NetlinkLinks {
    fn create_device(&self, name: &str, mac: &str) -> anyhow::Result<()> {
        self.create_tap(name)?;
        debug!("Created tap device {name}");

        let Some(mac) = parse_mac(mac) else {
            warn!("Ignoring malformed MAC address {mac:?} for {name}");
            return Ok(());
        };

        if let Err(e) = self.runtime.block_on(self.set_address(name, mac)) {
            self.roll_back(name);
            return Err(e.context(format!("Failed to set MAC address of {name}")));
        }

        Ok(())
    }

    fn assign_address(&self, name: &str, cidr: &str) -> anyhow::Result<()> {
        let (ip, prefix_len) = parse_cidr(cidr)?;

        self.runtime
            .block_on(self.add_ip(name, ip, prefix_len))
            .with_context(|| format!("Failed to add {cidr} to {name}"))
    }

    fn delete_device(&self, name: &str) -> anyhow::Result<()> {
        self.runtime.block_on(self.delete_link(name))?;
        debug!("Deleted device {name}");

        Ok(())
    }
}

/// Parses `aa:bb:cc:dd:ee:ff`.
pub(crate) fn parse_mac(mac: &str) -> Option<[u8; 6]> {
    let mut bytes = [0u8; 6];
    let mut parts = mac.split(':');

    for byte in bytes.iter_mut() {
        let part = parts.next()?;
        if part.len() != 2 {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }

    parts.next().is_none().then_some(bytes)
}

/// Parses `address/prefix` for either address family.
pub(crate) fn parse_cidr(cidr: &str) -> anyhow::Result<(IpAddr, u8)> {
    let (ip_str, len_str) = cidr
        .split_once('/')
        .ok_or(anyhow::anyhow!("Invalid CIDR {cidr}"))?;

    let ip = ip_str.parse::<IpAddr>()?;
    let len = len_str.parse::<u8>()?;

    let max = if ip.is_ipv4() { 32 } else { 128 };
    if len > max {
        return Err(anyhow::anyhow!("Invalid prefix length {len}"));
    }

    Ok((ip, len))
}
