use std::fs;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;

use drm::{control::Device as ControlDevice, Device as BasicDevice};
use rustix::fs::{Mode, OFlags};
use tracing::{debug, error, info, warn};

use crate::error::InitError;
use crate::utils::DevPath;

const DRI_DIR: &str = "/dev/dri";

#[derive(Debug)]
struct InternalDrmDeviceFd {
    fd: OwnedFd,
    privileged: bool,
}

impl Drop for InternalDrmDeviceFd {
    fn drop(&mut self) {
        info!("Dropping device: {:?}", self.fd.dev_path());
        if self.privileged {
            if let Err(err) = self.release_master_lock() {
                error!("Failed to drop drm master state. Error: {}", err);
            }
        }
    }
}

impl AsFd for InternalDrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
impl BasicDevice for InternalDrmDeviceFd {}
impl ControlDevice for InternalDrmDeviceFd {}

/// Ref-counted file descriptor of an open drm device
#[derive(Debug, Clone)]
pub struct DrmDeviceFd(Arc<InternalDrmDeviceFd>);

impl AsFd for DrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.fd.as_fd()
    }
}

impl AsRawFd for DrmDeviceFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.fd.as_raw_fd()
    }
}

impl DrmDeviceFd {
    /// Create a new `DrmDeviceFd`.
    ///
    /// This function will try to acquire the master lock for the underlying drm device
    /// and release the lock on drop again.
    pub fn new(fd: OwnedFd) -> DrmDeviceFd {
        let mut dev = InternalDrmDeviceFd { fd, privileged: false };

        // We want to modeset, so we better be the master.
        // Newer kernels grant this permission, if no other process is already the *master*.
        // So we skip over this error.
        if dev.acquire_master_lock().is_err() {
            warn!("Unable to become drm master, assuming unprivileged mode");
        } else {
            dev.privileged = true;
        }

        DrmDeviceFd(Arc::new(dev))
    }

    /// Open the first device node driven by one of `drivers`
    ///
    /// Candidates are tried in order, so earlier driver names take precedence over later ones
    /// regardless of the node numbering. Returns the device and the name of the matching driver.
    pub fn open_driver<S: AsRef<str>>(drivers: &[S]) -> Result<(DrmDeviceFd, String), InitError> {
        let nodes = card_nodes();
        for driver in drivers {
            let driver = driver.as_ref();
            for node in &nodes {
                let fd = match rustix::fs::open(node, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty()) {
                    Ok(fd) => fd,
                    Err(err) => {
                        debug!(?node, ?err, "Unable to open drm node");
                        continue;
                    }
                };
                match driver_name(&fd) {
                    Some(name) if name == driver => {
                        info!(?node, driver, "Opened drm device");
                        return Ok((DrmDeviceFd::new(fd), name));
                    }
                    _ => continue,
                }
            }
        }

        error!("Failed to open any drm device");
        Err(InitError::NoBackend {
            tried: drivers.iter().map(|d| d.as_ref().to_string()).collect(),
        })
    }

    /// Name of the kernel driver behind this device
    pub fn driver_name(&self) -> Option<String> {
        driver_name(&self.0.fd)
    }
}

impl BasicDevice for DrmDeviceFd {}
impl ControlDevice for DrmDeviceFd {}

struct Probe<'a>(BorrowedFd<'a>);

impl<'a> AsFd for Probe<'a> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0
    }
}
impl<'a> BasicDevice for Probe<'a> {}

fn driver_name(fd: &OwnedFd) -> Option<String> {
    Probe(fd.as_fd())
        .get_driver()
        .ok()
        .map(|driver| driver.name().to_string_lossy().into_owned())
}

fn card_nodes() -> Vec<PathBuf> {
    let mut nodes = fs::read_dir(DRI_DIR)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| {
                    path.file_name()
                        .and_then(|name| name.to_str())
                        .map(|name| name.starts_with("card"))
                        .unwrap_or(false)
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    nodes.sort();
    nodes
}
