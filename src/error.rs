//! Error types of the composer
//!
//! Nothing in this crate panics across the client boundary: every operation returns one of these.

use std::io;
use std::path::PathBuf;

use crate::display::DisplayIndex;
use crate::format::PixelFormat;

/// A failed call into the kernel display subsystem
#[derive(thiserror::Error, Debug)]
#[error("DRM access error: {errmsg} on device `{dev:?}` ({source:})")]
pub struct AccessError {
    /// Error message associated to the access error
    pub errmsg: &'static str,
    /// Device on which the error was generated
    pub dev: Option<PathBuf>,
    /// Underlying device error
    #[source]
    pub source: io::Error,
}

impl AccessError {
    /// Raw os error code of the failed call, if any
    pub fn raw_os_error(&self) -> Option<i32> {
        self.source.raw_os_error()
    }
}

/// Errors bringing up the device or one of its displays
#[derive(thiserror::Error, Debug)]
pub enum InitError {
    /// None of the candidate drivers could be opened
    #[error("No usable display backend found (tried {tried:?})")]
    NoBackend {
        /// Driver names that were tried, in order
        tried: Vec<String>,
    },
    /// The kernel rejected a query while probing
    #[error(transparent)]
    Access(#[from] AccessError),
    /// There is no connector in the resource slot of this display
    #[error("No connector for display {0:?}")]
    NoSuchDisplay(DisplayIndex),
    /// The connector is connected but advertises no mode
    #[error("Connector of display {0:?} has no mode")]
    NoMode(DisplayIndex),
    /// No encoder of the connector can drive the crtc of this display
    #[error("No encoder of display {0:?} supports its crtc")]
    NoUsableEncoder(DisplayIndex),
    /// The vsync thread could not be started
    #[error("Failed to start the vsync thread")]
    EventThread(#[source] io::Error),
}

/// Errors reported to the client by the frame protocol and the display queries
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The pixel format of a buffer has no hardware fourcc mapping
    #[error("Pixel format {0:?} has no fourcc mapping")]
    UnsupportedFormat(PixelFormat),
    /// A buffer is not backed by the expected allocator and cannot be imported
    #[error("Buffer on display {0:?} is not backed by the expected allocator")]
    ForeignBuffer(DisplayIndex),
    /// The kernel rejected a crtc, plane or framebuffer operation
    #[error("Failed to program the display hardware")]
    Programming(#[from] AccessError),
    /// The display is not connected
    #[error("Display {0:?} is not connected")]
    Disconnected(DisplayIndex),
    /// The display was never initialized
    #[error("Display {0:?} does not exist")]
    NoSuchDisplay(DisplayIndex),
    /// Unknown display configuration id
    #[error("Unknown display configuration {0}")]
    InvalidConfig(u32),
    /// More than one framebuffer target was handed over for one frame
    #[error("Display {0:?} got more than one framebuffer target")]
    MultipleTargets(DisplayIndex),
}

impl Error {
    /// Raw os error code of the underlying kernel failure, if any
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Programming(err) => err.raw_os_error(),
            _ => None,
        }
    }
}
