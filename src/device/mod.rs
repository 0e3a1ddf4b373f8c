//! Boundary to the kernel display subsystem
//!
//! The composer talks to the display hardware exclusively through the [`KmsDevice`] trait. It mirrors
//! the handful of mode-setting ioctls a legacy (non-atomic) hardware composer needs: enumerate
//! connectors, encoders, crtcs and planes, import dma-buf backed buffers, register framebuffers,
//! program the crtc and the overlay planes, set object properties and request vertical blank events.
//!
//! [`DrmDeviceFd`] implements it on top of [`drm-rs`](drm). Handles are the ones of the
//! [`drm`] crate, so every implementation speaks the same identifiers.

use std::fmt;
use std::os::unix::io::{AsFd, BorrowedFd};
use std::time::Duration;

use drm::buffer::Handle as BufferHandle;
use drm::control::{connector, crtc, encoder, framebuffer, plane};

use crate::display::DisplayIndex;
use crate::error::AccessError;
use crate::format::ScanoutLayout;
use crate::utils::{Buffer, Physical, Rectangle};

mod drm_device;
mod fd;
mod framebuffer_guard;

pub use self::fd::DrmDeviceFd;
pub use self::framebuffer_guard::{ImportedBuffer, ScanoutFramebuffer};

/// Display timing of an output
#[derive(Debug, Clone, Copy)]
pub struct Mode {
    size: (u16, u16),
    vrefresh: u32,
    raw: Option<drm::control::Mode>,
}

impl Mode {
    /// Describe a mode by its geometry only
    ///
    /// Such a mode cannot be programmed on a real device, see [`Mode::raw`].
    pub fn new(width: u16, height: u16, vrefresh: u32) -> Self {
        Mode {
            size: (width, height),
            vrefresh,
            raw: None,
        }
    }

    /// Resolution in pixels
    pub fn size(&self) -> (u16, u16) {
        self.size
    }

    /// Refresh rate in Hz
    pub fn vrefresh(&self) -> u32 {
        self.vrefresh
    }

    /// The kernel mode this was read from, if any
    pub fn raw(&self) -> Option<drm::control::Mode> {
        self.raw
    }
}

impl PartialEq for Mode {
    fn eq(&self, other: &Self) -> bool {
        self.size == other.size && self.vrefresh == other.vrefresh
    }
}

impl From<drm::control::Mode> for Mode {
    fn from(mode: drm::control::Mode) -> Self {
        Mode {
            size: mode.size(),
            vrefresh: mode.vrefresh(),
            raw: Some(mode),
        }
    }
}

/// Top-level mode-setting resources
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resources {
    /// Connectors, in kernel order
    pub connectors: Vec<connector::Handle>,
    /// Crtcs, in kernel order. Possible-crtc bitmasks index into this list.
    pub crtcs: Vec<crtc::Handle>,
}

/// State of a connector
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorInfo {
    /// Connector handle
    pub handle: connector::Handle,
    /// Whether a sink is attached
    pub connected: bool,
    /// Advertised modes, preferred first
    pub modes: Vec<Mode>,
    /// Encoders able to drive this connector
    pub encoders: Vec<encoder::Handle>,
    /// Physical size in millimeters, if known
    pub size_mm: Option<(u32, u32)>,
}

/// An encoder and the crtcs it can be driven by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderInfo {
    /// Encoder handle
    pub handle: encoder::Handle,
    /// Bitmask of crtc indices this encoder supports
    pub possible_crtcs: u32,
}

/// A hardware plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneInfo {
    /// Plane handle
    pub handle: plane::Handle,
    /// Bitmask of crtc indices this plane can be shown on
    pub possible_crtcs: u32,
    /// Supported fourcc codes
    pub formats: Vec<u32>,
}

impl PlaneInfo {
    /// Whether the plane can be shown on the crtc with the given index
    pub fn supports_crtc(&self, crtc_index: u32) -> bool {
        crtc_index < 32 && self.possible_crtcs & (1 << crtc_index) != 0
    }

    /// Whether the plane can scan out the given fourcc
    pub fn supports_format(&self, fourcc: drm_fourcc::DrmFourcc) -> bool {
        self.formats.contains(&(fourcc as u32))
    }
}

/// Object a property is set on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectRef {
    /// A plane, e.g. for `zpos`
    Plane(plane::Handle),
    /// A connector, e.g. for `DPMS`
    Connector(connector::Handle),
}

/// A vertical blank observed on one display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VblankEvent {
    /// Display the blank was requested for
    pub display: DisplayIndex,
    /// Kernel vblank counter
    pub sequence: u32,
    /// Time of the blank, with microsecond precision
    pub time: Duration,
}

impl VblankEvent {
    /// Timestamp in nanoseconds, as delivered to vsync observers
    pub fn timestamp_ns(&self) -> i64 {
        self.time.as_secs() as i64 * 1_000_000_000 + self.time.subsec_micros() as i64 * 1_000
    }
}

/// The kernel display subsystem as seen by the composer
///
/// All calls are synchronous. The file descriptor returned by [`AsFd`] becomes readable whenever
/// [`KmsDevice::receive_vblanks`] has events to deliver.
pub trait KmsDevice: AsFd + fmt::Debug + Send + Sync + 'static {
    /// Enumerate connectors and crtcs
    fn resources(&self) -> Result<Resources, AccessError>;

    /// Query a connector
    fn connector_info(&self, handle: connector::Handle) -> Result<ConnectorInfo, AccessError>;

    /// Query an encoder
    fn encoder_info(&self, handle: encoder::Handle) -> Result<EncoderInfo, AccessError>;

    /// Enumerate all hardware planes
    fn planes(&self) -> Result<Vec<plane::Handle>, AccessError>;

    /// Query a plane
    fn plane_info(&self, handle: plane::Handle) -> Result<PlaneInfo, AccessError>;

    /// Import a dma-buf file descriptor as a buffer handle
    fn import_buffer(&self, fd: BorrowedFd<'_>) -> Result<BufferHandle, AccessError>;

    /// Release a buffer handle obtained from [`KmsDevice::import_buffer`]
    fn release_buffer(&self, handle: BufferHandle) -> Result<(), AccessError>;

    /// Register a framebuffer object for an imported buffer
    fn register_framebuffer(&self, layout: &ScanoutLayout) -> Result<framebuffer::Handle, AccessError>;

    /// Remove a framebuffer object
    fn remove_framebuffer(&self, fb: framebuffer::Handle) -> Result<(), AccessError>;

    /// Mode-set the crtc to show `fb` on `connector`
    fn program_crtc(
        &self,
        crtc: crtc::Handle,
        fb: framebuffer::Handle,
        connector: connector::Handle,
        mode: &Mode,
    ) -> Result<(), AccessError>;

    /// Show `fb` on an overlay plane, or disable the plane if `fb` is `None`
    fn program_plane(
        &self,
        plane: plane::Handle,
        crtc: crtc::Handle,
        fb: Option<framebuffer::Handle>,
        dst: Rectangle<Physical>,
        src: Rectangle<Buffer>,
    ) -> Result<(), AccessError>;

    /// Set a property looked up by name
    ///
    /// Returns `false` if the object has no property of that name.
    fn set_named_property(&self, object: ObjectRef, name: &str, value: u64) -> Result<bool, AccessError>;

    /// Request one event for the next vertical blank of the crtc with index `pipe`
    fn request_vblank(&self, display: DisplayIndex, pipe: u32) -> Result<(), AccessError>;

    /// Read all pending vertical blank events
    fn receive_vblanks(&self) -> Result<Vec<VblankEvent>, AccessError>;
}
