//! Overlay plane assignment
//!
//! Planes are handed out first-fit, in the order the device enumerates them. A plane is claimed
//! for the whole frame as soon as one layer got it; [`PlaneClaims`] is reset at the start of every
//! classification pass, which implicitly gives every plane back.
//!
//! [`classify`] walks the layer list from the front-most layer backwards. Layers get an overlay plane
//! until the first one that does not fit. That layer and everything below it is composed by the
//! client into the framebuffer target, which occupies a single z-position.

use drm::control::plane;
use tracing::{debug, trace};

use crate::device::KmsDevice;
use crate::display::Display;
use crate::error::Error;
use crate::format::{fourcc_for, PixelFormat};
use crate::layer::{CompositionType, DisplayContents};

/// Number of planes [`PlaneClaims`] can track
pub const MAX_PLANES: usize = 64;

/// Planes claimed during the current frame, by enumeration index
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PlaneClaims(u64);

impl PlaneClaims {
    /// No plane claimed
    pub fn new() -> Self {
        PlaneClaims(0)
    }

    /// Release every plane
    pub fn reset(&mut self) {
        self.0 = 0;
    }

    /// Claim every plane, leaving nothing to assign
    pub fn claim_all(&mut self) {
        self.0 = u64::MAX;
    }

    /// Claim the plane with enumeration index `idx`
    ///
    /// Returns `false` if it was already claimed or cannot be tracked.
    pub fn claim(&mut self, idx: usize) -> bool {
        if idx >= MAX_PLANES || self.is_claimed(idx) {
            return false;
        }
        self.0 |= 1 << idx;
        true
    }

    /// Whether the plane with enumeration index `idx` is claimed
    pub fn is_claimed(&self, idx: usize) -> bool {
        idx >= MAX_PLANES || self.0 & (1 << idx) != 0
    }

    /// Number of claimed planes
    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }
}

/// Find and claim a free plane able to show `format` on the crtc with index `crtc_index`
///
/// Fails with [`Error::UnsupportedFormat`] if `format` has no fourcc mapping.
pub fn find_plane<D: KmsDevice>(
    device: &D,
    crtc_index: u32,
    format: PixelFormat,
    claims: &mut PlaneClaims,
) -> Result<Option<plane::Handle>, Error> {
    let fourcc = fourcc_for(format).ok_or(Error::UnsupportedFormat(format))?;

    for (idx, handle) in device.planes()?.into_iter().enumerate() {
        if claims.is_claimed(idx) {
            trace!(plane = ?handle, "skipping claimed plane");
            continue;
        }
        let info = match device.plane_info(handle) {
            Ok(info) => info,
            Err(err) => {
                trace!(plane = ?handle, ?err, "skipping plane without info");
                continue;
            }
        };
        if !info.supports_crtc(crtc_index) {
            trace!(plane = ?handle, crtc_index, "skipping plane of other crtc");
            continue;
        }
        if info.supports_format(fourcc) {
            claims.claim(idx);
            return Ok(Some(handle));
        }
    }

    Ok(None)
}

/// Decide the composition type of every layer of one frame
///
/// Layers flagged to be skipped and the framebuffer target keep their composition type. Every other
/// layer is either bound to a distinct overlay plane or left to the client.
#[profiling::function]
pub fn classify<D: KmsDevice>(
    device: &D,
    display: &Display<D>,
    contents: &mut DisplayContents,
    claims: &mut PlaneClaims,
) -> Result<(), Error> {
    let _guard = display.span().enter();

    let targets = contents
        .layers
        .iter()
        .filter(|l| l.composition == CompositionType::FramebufferTarget)
        .count();
    if targets > 1 {
        return Err(Error::MultipleTargets(display.index()));
    }

    let mut anchored = false;
    for (idx, layer) in contents.layers.iter_mut().enumerate().rev() {
        if layer.is_passthrough() {
            continue;
        }
        layer.bind_plane(None);

        if anchored {
            layer.composition = CompositionType::Framebuffer;
            continue;
        }

        let plane = match layer.buffer.as_ref() {
            Some(buffer) => match find_plane(device, display.crtc_index(), buffer.format(), claims) {
                Ok(plane) => plane,
                Err(Error::UnsupportedFormat(format)) => {
                    debug!(layer = idx, ?format, "no fourcc for layer format");
                    None
                }
                Err(err) => return Err(err),
            },
            None => None,
        };

        match plane {
            Some(plane) => {
                trace!(layer = idx, ?plane, "assigned overlay plane");
                layer.composition = CompositionType::Overlay;
                layer.bind_plane(Some(plane));
            }
            None => {
                debug!(layer = idx, "layer anchors the framebuffer target");
                layer.composition = CompositionType::Framebuffer;
                anchored = true;
            }
        }
    }

    Ok(())
}
