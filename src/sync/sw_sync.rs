use std::io;
use std::os::unix::io::{FromRawFd, OwnedFd};

use rustix::fs::{Mode, OFlags};
use rustix::ioctl::{ioctl, ReadWriteOpcode, Setter, Updater, WriteOpcode};
use tracing::debug;

use super::SyncTimeline;

const SW_SYNC_PATHS: &[&str] = &["/sys/kernel/debug/sync/sw_sync", "/dev/sw_sync"];

type CreateFence = ReadWriteOpcode<b'W', 0, CreateFenceData>;
type Increment = WriteOpcode<b'W', 1, u32>;

#[repr(C)]
struct CreateFenceData {
    value: u32,
    name: [u8; 32],
    fence: i32,
}

/// Kernel software sync timeline
///
/// Fences created on this timeline are regular sync files and can be passed to other processes.
#[derive(Debug)]
pub struct SwSyncTimeline {
    fd: OwnedFd,
}

impl SwSyncTimeline {
    /// Open a new timeline on the first available sw_sync node
    pub fn open() -> io::Result<Self> {
        let mut last_err = io::Error::from(io::ErrorKind::NotFound);
        for path in SW_SYNC_PATHS {
            match rustix::fs::open(*path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty()) {
                Ok(fd) => {
                    debug!(path, "Opened sw_sync timeline");
                    return Ok(SwSyncTimeline { fd });
                }
                Err(err) => last_err = err.into(),
            }
        }
        Err(last_err)
    }
}

impl SyncTimeline for SwSyncTimeline {
    fn advance(&self, steps: u32) -> io::Result<()> {
        // SAFETY: SW_SYNC_IOC_INC reads a single u32 through the pointer
        unsafe { ioctl(&self.fd, Setter::<Increment, u32>::new(steps)) }?;
        Ok(())
    }

    fn create_fence(&self, name: &str, point: u64) -> io::Result<OwnedFd> {
        let mut data = CreateFenceData {
            // the kernel timeline is 32 bit and wraps together with the fence values
            value: point as u32,
            name: [0; 32],
            fence: -1,
        };
        let len = name.len().min(data.name.len() - 1);
        data.name[..len].copy_from_slice(&name.as_bytes()[..len]);

        // SAFETY: `data` matches the layout of `struct sw_sync_create_fence_data`
        unsafe { ioctl(&self.fd, Updater::<CreateFence, CreateFenceData>::new(&mut data)) }?;
        // SAFETY: the kernel returned a freshly created fd we now own
        Ok(unsafe { OwnedFd::from_raw_fd(data.fence) })
    }
}
