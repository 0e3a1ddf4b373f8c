//! Boundary to the graphics buffer allocator
//!
//! The composer never allocates buffers. It only reads the geometry, format and backing file
//! descriptor of the buffers the client hands over with each layer.

use std::fmt;
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};

use crate::format::PixelFormat;

/// Metadata of a graphics buffer, as described by the allocator
pub trait Buffer: fmt::Debug + Send + Sync {
    /// Width in pixels
    fn width(&self) -> u32;
    /// Height in pixels
    fn height(&self) -> u32;
    /// Pixel format as enumerated by the allocator
    fn format(&self) -> PixelFormat;
    /// File descriptor backing the buffer memory
    fn fd(&self) -> BorrowedFd<'_>;
    /// Whether the buffer was allocated by the allocator the display device can import from
    fn is_allocator_backed(&self) -> bool;
}

bitflags::bitflags! {
    /// Allocation flags of a [`GrallocBuffer`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferFlags: u32 {
        /// Memory is shared through a dma-buf exporting heap
        const USES_ION = 0x0000_0020;
        /// Buffer is the framebuffer target the GPU composes into
        const FRAMEBUFFER = 0x0000_0001;
    }
}

/// A buffer handle as exported by the allocator
#[derive(Debug)]
pub struct GrallocBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    flags: BufferFlags,
    fd: OwnedFd,
}

impl GrallocBuffer {
    /// Wrap an allocator exported buffer
    pub fn new(fd: OwnedFd, width: u32, height: u32, format: PixelFormat, flags: BufferFlags) -> Self {
        GrallocBuffer {
            width,
            height,
            format,
            flags,
            fd,
        }
    }

    /// Allocation flags of this buffer
    pub fn flags(&self) -> BufferFlags {
        self.flags
    }
}

impl Buffer for GrallocBuffer {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn format(&self) -> PixelFormat {
        self.format
    }

    fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    fn is_allocator_backed(&self) -> bool {
        self.flags.contains(BufferFlags::USES_ION)
    }
}
