use std::{
    collections::HashMap,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::Mutex,
    thread,
    time::Duration,
};

use anyhow::Context;
use log::{debug, warn};
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};

use super::{AttachmentHandle, SwitchClient};

/// How long a freshly spawned plug must stay alive to count as attached.
const STARTUP_GRACE: Duration = Duration::from_millis(200);

/// Attaches devices by running `vde_plug tap://<device> <vnl>`.
///
/// The attachment handle is the helper's PID, so it stays meaningful across
/// restarts of this daemon. Plugs spawned by an earlier run are only
/// signalled while their PID still runs the helper program.
pub struct VdePlugProcess {
    program: PathBuf,
    children: Mutex<HashMap<u32, Child>>,
}

impl VdePlugProcess {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `pid` currently runs our helper program.
    fn is_plug(&self, pid: u32) -> bool {
        let Ok(cmdline) = std::fs::read(format!("/proc/{pid}/cmdline")) else {
            return false;
        };
        let Some(argv0) = cmdline.split(|b| *b == 0).next() else {
            return false;
        };

        let argv0 = Path::new(std::ffi::OsStr::from_bytes(argv0));
        argv0 == self.program || argv0.file_name() == self.program.file_name()
    }
}

impl SwitchClient for VdePlugProcess {
    fn attach(&self, device: &str, switch_address: &str) -> anyhow::Result<AttachmentHandle> {
        debug!("vde_plug attach [ {device} ] [ {switch_address} ]");

        let mut child = Command::new(&self.program)
            .arg(format!("tap://{device}"))
            .arg(switch_address)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.program.display()))?;

        thread::sleep(STARTUP_GRACE);
        if let Some(status) = child.try_wait()? {
            anyhow::bail!("Plug of {device} to {switch_address} exited with {status}");
        }

        let pid = child.id();
        self.children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pid, child);

        Ok(AttachmentHandle::new(pid as usize))
    }

    fn detach(&self, handle: AttachmentHandle) {
        if !handle.is_attached() {
            return;
        }

        let pid = handle.raw() as u32;
        let child = self
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&pid);

        // Plugs from an earlier run are known by PID only, which may be reused.
        if child.is_none() && !self.is_plug(pid) {
            warn!(
                "Process {pid} is not a {} plug, not stopping it",
                self.program.display()
            );
            return;
        }

        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!("Failed to stop plug {pid}: {e}");
        }

        if let Some(mut child) = child {
            let _ = child.wait();
        }
    }
}

#[cfg(feature = "libvdeplug")]
mod ffi {
    use std::os::raw::c_char;

    #[link(name = "vdeplug")]
    extern "C" {
        pub fn vdeplug_join(ifname: *const c_char, vnl: *const c_char) -> usize;
        pub fn vdeplug_leave(plug: usize);
    }
}

/// Attaches devices in-process through libvdeplug.
#[cfg(feature = "libvdeplug")]
#[derive(Default)]
pub struct LibVdePlug;

#[cfg(feature = "libvdeplug")]
impl SwitchClient for LibVdePlug {
    fn attach(&self, device: &str, switch_address: &str) -> anyhow::Result<AttachmentHandle> {
        let ifname = std::ffi::CString::new(device)?;
        let vnl = std::ffi::CString::new(switch_address)?;

        let plug = unsafe { ffi::vdeplug_join(ifname.as_ptr(), vnl.as_ptr()) };
        if plug == 0 {
            anyhow::bail!("vdeplug_join failed: {device} to {switch_address}");
        }

        Ok(AttachmentHandle::new(plug))
    }

    fn detach(&self, handle: AttachmentHandle) {
        if handle.is_attached() {
            unsafe { ffi::vdeplug_leave(handle.raw()) };
        }
    }
}
