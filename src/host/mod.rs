//! Host primitives the driver coordinates: virtual link devices and switch
//! attachments. Both are blocking calls with no transactional guarantee.

use serde::{Deserialize, Serialize};

mod link;
mod vdeplug;

pub use link::NetlinkLinks;
#[cfg(feature = "libvdeplug")]
pub use vdeplug::LibVdePlug;
pub use vdeplug::VdePlugProcess;

/// Live attachment of a device to a switch. Zero means "not attached".
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct AttachmentHandle(usize);

impl AttachmentHandle {
    pub const UNATTACHED: AttachmentHandle = AttachmentHandle(0);

    pub fn new(raw: usize) -> Self {
        AttachmentHandle(raw)
    }

    pub fn raw(&self) -> usize {
        self.0
    }

    pub fn is_attached(&self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for AttachmentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Creates, addresses and removes the per-endpoint host device.
#[cfg_attr(test, mockall::automock)]
pub trait LinkManager: Send + Sync {
    /// Creates a point-to-point device named `name` with hardware address `mac`.
    fn create_device(&self, name: &str, mac: &str) -> anyhow::Result<()>;

    /// Adds an `address/prefix` to the device.
    fn assign_address(&self, name: &str, cidr: &str) -> anyhow::Result<()>;

    /// Removes the device. Fails when no such device exists in this namespace.
    fn delete_device(&self, name: &str) -> anyhow::Result<()>;
}

/// Plugs devices into the external switch named by a VNL.
#[cfg_attr(test, mockall::automock)]
pub trait SwitchClient: Send + Sync {
    fn attach(&self, device: &str, switch_address: &str) -> anyhow::Result<AttachmentHandle>;

    fn detach(&self, handle: AttachmentHandle);
}
