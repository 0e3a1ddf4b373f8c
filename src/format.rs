//! Client pixel formats and their scanout layout
//!
//! Clients describe buffers with the allocator's native pixel format enumeration. The kernel only knows
//! fourcc codes, so every buffer that is scanned out goes through [`fourcc_for`]. The table is fixed:
//! a format without an entry can never be put on a plane or the crtc.

use drm::buffer::{Handle as BufferHandle, PlanarBuffer};
use drm_fourcc::{DrmFourcc, DrmModifier};

/// Pixel format as enumerated by the graphics buffer allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelFormat(pub i32);

impl PixelFormat {
    /// 32-bit RGBA, byte order R, G, B, A
    pub const RGBA_8888: PixelFormat = PixelFormat(1);
    /// 32-bit RGB with unused alpha byte
    pub const RGBX_8888: PixelFormat = PixelFormat(2);
    /// Packed 24-bit RGB
    pub const RGB_888: PixelFormat = PixelFormat(3);
    /// 16-bit RGB 5:6:5
    pub const RGB_565: PixelFormat = PixelFormat(4);
    /// 32-bit BGRA, byte order B, G, R, A
    pub const BGRA_8888: PixelFormat = PixelFormat(5);
    /// 16-bit raw sensor data
    pub const RAW16: PixelFormat = PixelFormat(0x20);
    /// Opaque blob
    pub const BLOB: PixelFormat = PixelFormat(0x21);
    /// Allocator chosen layout
    pub const IMPLEMENTATION_DEFINED: PixelFormat = PixelFormat(0x22);
    /// Flexible 4:2:0 YCbCr
    pub const YCBCR_420_888: PixelFormat = PixelFormat(0x23);
    /// 4:2:0 planar YCrCb
    pub const YV12: PixelFormat = PixelFormat(0x3231_5659);
}

static FOURCC_TABLE: &[(PixelFormat, DrmFourcc)] = &[
    (PixelFormat::RGBA_8888, DrmFourcc::Abgr8888),
    (PixelFormat::RGBX_8888, DrmFourcc::Xbgr8888),
    (PixelFormat::BGRA_8888, DrmFourcc::Argb8888),
    (PixelFormat::RGB_888, DrmFourcc::Rgb888),
    (PixelFormat::RGB_565, DrmFourcc::Rgb565),
    (PixelFormat::YV12, DrmFourcc::Nv12),
];

/// Returns the fourcc code a client pixel format is scanned out as
pub fn fourcc_for(format: PixelFormat) -> Option<DrmFourcc> {
    FOURCC_TABLE
        .iter()
        .find(|(client, _)| *client == format)
        .map(|(_, fourcc)| *fourcc)
}

/// Returns the client pixel formats that can be scanned out
pub fn supported_formats() -> impl Iterator<Item = PixelFormat> {
    FOURCC_TABLE.iter().map(|(client, _)| *client)
}

fn bytes_per_pixel(fourcc: DrmFourcc) -> u32 {
    match fourcc {
        DrmFourcc::Rgb565 => 2,
        DrmFourcc::Rgb888 => 3,
        // luma plane of the semi-planar formats
        DrmFourcc::Nv12 => 1,
        _ => 4,
    }
}

/// Plane layout of an imported buffer, as handed to the framebuffer registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanoutLayout {
    size: (u32, u32),
    fourcc: DrmFourcc,
    handles: [Option<BufferHandle>; 4],
    pitches: [u32; 4],
    offsets: [u32; 4],
}

impl ScanoutLayout {
    /// Describe a single-allocation buffer of the given geometry
    ///
    /// Semi-planar 4:2:0 formats get a second plane descriptor on the same allocation,
    /// starting right after the luma plane.
    pub fn new(fourcc: DrmFourcc, width: u32, height: u32, handle: BufferHandle) -> Self {
        let mut handles = [Some(handle), None, None, None];
        let mut pitches = [width * bytes_per_pixel(fourcc), 0, 0, 0];
        let mut offsets = [0; 4];

        if fourcc == DrmFourcc::Nv12 {
            handles[1] = Some(handle);
            pitches[1] = width;
            offsets[1] = width * height;
        }

        ScanoutLayout {
            size: (width, height),
            fourcc,
            handles,
            pitches,
            offsets,
        }
    }

    /// Number of plane descriptors in use
    pub fn plane_count(&self) -> usize {
        self.handles.iter().filter(|h| h.is_some()).count()
    }
}

impl PlanarBuffer for ScanoutLayout {
    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn format(&self) -> DrmFourcc {
        self.fourcc
    }

    fn modifier(&self) -> Option<DrmModifier> {
        None
    }

    fn pitches(&self) -> [u32; 4] {
        self.pitches
    }

    fn handles(&self) -> [Option<BufferHandle>; 4] {
        self.handles
    }

    fn offsets(&self) -> [u32; 4] {
        self.offsets
    }
}
