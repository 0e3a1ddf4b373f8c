use std::os::unix::io::BorrowedFd;
use std::sync::Arc;

use drm::buffer::Handle as BufferHandle;
use drm::control::framebuffer;
use tracing::{trace, warn};

use super::KmsDevice;
use crate::error::AccessError;
use crate::format::ScanoutLayout;

/// A buffer imported into the device, released again on drop
#[derive(Debug)]
pub struct ImportedBuffer<'a, D: KmsDevice> {
    handle: BufferHandle,
    device: &'a D,
}

impl<'a, D: KmsDevice> ImportedBuffer<'a, D> {
    /// Import a dma-buf file descriptor
    pub fn import(device: &'a D, fd: BorrowedFd<'_>) -> Result<Self, AccessError> {
        let handle = device.import_buffer(fd)?;
        Ok(ImportedBuffer { handle, device })
    }

    /// The device local buffer handle
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }
}

impl<'a, D: KmsDevice> Drop for ImportedBuffer<'a, D> {
    fn drop(&mut self) {
        if let Err(err) = self.device.release_buffer(self.handle) {
            warn!(buffer = ?self.handle, ?err, "failed to release imported buffer");
        }
    }
}

/// A registered framebuffer object, removed again on drop
#[derive(Debug)]
pub struct ScanoutFramebuffer<D: KmsDevice> {
    fb: framebuffer::Handle,
    device: Arc<D>,
}

impl<D: KmsDevice> ScanoutFramebuffer<D> {
    /// Register a framebuffer for an imported buffer
    pub fn register(device: &Arc<D>, layout: &ScanoutLayout) -> Result<Self, AccessError> {
        let fb = device.register_framebuffer(layout)?;
        trace!(?fb, "registered framebuffer");
        Ok(ScanoutFramebuffer {
            fb,
            device: device.clone(),
        })
    }

    /// The framebuffer handle
    pub fn handle(&self) -> framebuffer::Handle {
        self.fb
    }
}

impl<D: KmsDevice> AsRef<framebuffer::Handle> for ScanoutFramebuffer<D> {
    fn as_ref(&self) -> &framebuffer::Handle {
        &self.fb
    }
}

impl<D: KmsDevice> Drop for ScanoutFramebuffer<D> {
    fn drop(&mut self) {
        trace!(fb = ?self.fb, "destroying framebuffer");
        if let Err(err) = self.device.remove_framebuffer(self.fb) {
            warn!(fb = ?self.fb, ?err, "failed to destroy framebuffer");
        }
    }
}
