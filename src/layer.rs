//! Per-frame layer lists handed over by the client

use std::os::unix::io::OwnedFd;
use std::sync::Arc;

use drm::control::plane;

use crate::buffer::Buffer;
use crate::sync::ReleaseFence;
use crate::utils::{Buffer as BufferCoords, Physical, Rectangle};

/// How a layer ends up on screen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompositionType {
    /// Composed by the client into the framebuffer target
    #[default]
    Framebuffer,
    /// Scanned out directly from a hardware overlay plane
    Overlay,
    /// The surface the client composes all [`Framebuffer`](CompositionType::Framebuffer) layers into
    FramebufferTarget,
}

bitflags::bitflags! {
    /// Client hints attached to a layer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LayerFlags: u32 {
        /// The client composes this layer itself, the composer must leave it alone
        const SKIP = 0x0000_0001;
    }
}

/// One visual element of one frame
///
/// Layers are ordered bottom to top. They only live for one classify/realize pair and never take
/// ownership of their buffer.
#[derive(Debug, Default)]
pub struct Layer {
    /// Content of the layer
    pub buffer: Option<Arc<dyn Buffer>>,
    /// Region of the buffer to show
    pub source_crop: Rectangle<BufferCoords>,
    /// Where on the display the layer is shown
    pub display_frame: Rectangle<Physical>,
    /// Composition decided by [`Composer::classify`](crate::compositor::Composer::classify)
    pub composition: CompositionType,
    /// Client hints
    pub flags: LayerFlags,
    /// Signaled once the producer finished writing the buffer, consumed by realize
    pub acquire_fence: Option<OwnedFd>,
    /// Signaled once the display stopped reading the buffer, written by realize
    pub release_fence: Option<ReleaseFence>,
    plane: Option<plane::Handle>,
}

impl Layer {
    /// Create a layer showing `buffer`
    pub fn new(
        buffer: Arc<dyn Buffer>,
        source_crop: Rectangle<BufferCoords>,
        display_frame: Rectangle<Physical>,
    ) -> Self {
        Layer {
            buffer: Some(buffer),
            source_crop,
            display_frame,
            ..Default::default()
        }
    }

    /// Create the framebuffer target layer showing `buffer` across the whole display
    pub fn framebuffer_target(buffer: Arc<dyn Buffer>) -> Self {
        let (w, h) = (buffer.width() as i32, buffer.height() as i32);
        Layer {
            buffer: Some(buffer),
            source_crop: Rectangle::new((0, 0), (w, h)),
            display_frame: Rectangle::new((0, 0), (w, h)),
            composition: CompositionType::FramebufferTarget,
            ..Default::default()
        }
    }

    /// Overlay plane bound to this layer for the current frame
    pub fn plane(&self) -> Option<plane::Handle> {
        self.plane
    }

    pub(crate) fn bind_plane(&mut self, plane: Option<plane::Handle>) {
        self.plane = plane;
    }

    /// Whether the classification pass has to leave this layer untouched
    pub fn is_passthrough(&self) -> bool {
        self.flags.contains(LayerFlags::SKIP) || self.composition == CompositionType::FramebufferTarget
    }
}

/// The layer list of one display for one frame
#[derive(Debug, Default)]
pub struct DisplayContents {
    /// Layers, bottom to top
    pub layers: Vec<Layer>,
    /// Signaled once this whole frame was replaced on screen, written by realize
    pub retire_fence: Option<ReleaseFence>,
}

impl DisplayContents {
    /// Create contents from a bottom to top layer list
    pub fn new(layers: Vec<Layer>) -> Self {
        DisplayContents {
            layers,
            retire_fence: None,
        }
    }

    /// Number of layers scanned out from overlay planes
    pub fn overlay_count(&self) -> usize {
        self.layers
            .iter()
            .filter(|l| l.composition == CompositionType::Overlay)
            .count()
    }

    /// The framebuffer target of this frame, if any
    pub fn framebuffer_target(&self) -> Option<&Layer> {
        self.layers
            .iter()
            .find(|l| l.composition == CompositionType::FramebufferTarget)
    }
}
