//! Network namespace handles and the scoped namespace switch.

use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use nix::sched::{setns, CloneFlags};
use tracing::{debug, error};

use super::iproute2::IpRoute2;
use crate::error::{Error, Result};

/// Namespace file of the calling thread.
const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

/// An open handle to a network namespace.
///
/// The namespace stays alive for as long as the handle is open, even if its
/// bind mount goes away.
#[derive(Debug)]
pub struct NetNs {
    path: PathBuf,
    file: File,
}

impl NetNs {
    /// Opens the namespace file at `path` (e.g. `/var/run/netns/foo`).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::not_found("network namespace", path.display().to_string()),
            _ => Error::NamespaceSwitch {
                path: path.display().to_string(),
                reason: e.to_string(),
            },
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Path the handle was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path through which another process can open this very handle.
    pub fn fd_path(&self) -> PathBuf {
        PathBuf::from(format!("/proc/{}/fd/{}", std::process::id(), self.file.as_raw_fd()))
    }
}

impl AsRawFd for NetNs {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Namespace operations of the calling thread.
pub trait NetNsOps {
    /// Opens a handle to the namespace the calling thread is in.
    fn current_ns(&self) -> Result<NetNs>;
    /// Moves the calling thread into `ns`.
    fn switch_ns(&self, ns: &NetNs) -> Result<()>;
}

/// Keeps the calling thread inside a namespace until dropped, then switches
/// back to the namespace it came from.
pub struct NetNsGuard<'a, O: NetNsOps + ?Sized> {
    ops: &'a O,
    previous: NetNs,
}

impl<'a, O: NetNsOps + ?Sized> NetNsGuard<'a, O> {
    pub fn enter(ops: &'a O, target: &NetNs) -> Result<Self> {
        let previous = ops.current_ns()?;
        ops.switch_ns(target)?;
        debug!("entered network namespace {}", target.path().display());
        Ok(Self { ops, previous })
    }
}

impl<O: NetNsOps + ?Sized> Drop for NetNsGuard<'_, O> {
    fn drop(&mut self) {
        if let Err(err) = self.ops.switch_ns(&self.previous) {
            error!(
                "failed to restore network namespace {}: {}",
                self.previous.path().display(),
                err
            );
        }
    }
}

/// Runs `f` with the calling thread inside `ns`.
///
/// The previous namespace is restored on every exit path, including when `f`
/// fails.
pub fn with_netns<O, T, F>(ops: &O, ns: &NetNs, f: F) -> Result<T>
where
    O: NetNsOps + ?Sized,
    F: FnOnce() -> Result<T>,
{
    let _guard = NetNsGuard::enter(ops, ns)?;
    f()
}

impl NetNsOps for IpRoute2 {
    fn current_ns(&self) -> Result<NetNs> {
        NetNs::open(THREAD_NETNS)
    }

    fn switch_ns(&self, ns: &NetNs) -> Result<()> {
        setns(ns.as_raw_fd(), CloneFlags::CLONE_NEWNET).map_err(|e| Error::NamespaceSwitch {
            path: ns.path().display().to_string(),
            reason: e.to_string(),
        })
    }
}
