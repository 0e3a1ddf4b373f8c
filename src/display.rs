//! Display registry
//!
//! A [`Display`] binds one output slot (connector, encoder, crtc) of the device and owns everything
//! that is currently scanned out on it. Displays live from [`HwComposer`](crate::compositor::HwComposer)
//! bring-up until teardown; the vsync thread only ever sees the shared part, [`DisplayShared`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use drm::control::{connector, crtc, encoder, plane};
use tracing::{debug, info, info_span, instrument, warn};

use crate::device::{KmsDevice, Mode, ScanoutFramebuffer};
use crate::error::{AccessError, InitError};
use crate::sync::FenceTimeline;

/// Identifies one of the fixed display slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DisplayIndex {
    /// The built-in display, connector and crtc slot 0
    Primary = 0,
    /// An external display, connector and crtc slot 1
    External = 1,
}

impl DisplayIndex {
    /// All display slots, in resource order
    pub const ALL: [DisplayIndex; 2] = [DisplayIndex::Primary, DisplayIndex::External];

    /// Slot of this display in the device resource lists
    pub fn index(self) -> usize {
        self as usize
    }

    /// Bit of this display in a display mask
    pub fn bit(self) -> u32 {
        1 << self.index()
    }

    /// The display occupying the given slot
    pub fn from_index(index: usize) -> Option<DisplayIndex> {
        DisplayIndex::ALL.get(index).copied()
    }
}

/// Dots per thousand inches of `pixels` spread over `mm` millimeters
///
/// Returns 0 if the physical size is unknown.
pub fn dots_per_kilo_inch(pixels: u16, mm: u32) -> i32 {
    if mm == 0 {
        return 0;
    }
    (pixels as u64 * 25_400 / mm as u64) as i32
}

/// Display state shared with the vsync thread
pub struct DisplayShared {
    index: DisplayIndex,
    pipe: u32,
    timeline: FenceTimeline,
    vsync_enabled: AtomicBool,
    armed: AtomicBool,
}

impl fmt::Debug for DisplayShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayShared")
            .field("index", &self.index)
            .field("pipe", &self.pipe)
            .field("timeline", &self.timeline)
            .field("vsync_enabled", &self.vsync_enabled.load(Ordering::Relaxed))
            .field("armed", &self.armed.load(Ordering::Relaxed))
            .finish()
    }
}

impl DisplayShared {
    pub(crate) fn new(index: DisplayIndex, pipe: u32, timeline: FenceTimeline) -> Self {
        DisplayShared {
            index,
            pipe,
            timeline,
            vsync_enabled: AtomicBool::new(false),
            armed: AtomicBool::new(false),
        }
    }

    /// Display slot
    pub fn index(&self) -> DisplayIndex {
        self.index
    }

    /// Crtc index vblank requests are issued for
    pub fn pipe(&self) -> u32 {
        self.pipe
    }

    /// Fence timeline of this display
    pub fn timeline(&self) -> &FenceTimeline {
        &self.timeline
    }

    /// Whether vsync events are delivered to the observer
    pub fn vsync_enabled(&self) -> bool {
        self.vsync_enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_vsync_enabled(&self, enabled: bool) {
        self.vsync_enabled.store(enabled, Ordering::Release);
    }

    /// Whether a vblank request is outstanding
    ///
    /// Without one the timeline does not move. The kernel refuses requests for an inactive crtc, so
    /// this is `false` until the crtc got programmed.
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Request the next vblank unless a request is already outstanding
    ///
    /// Returns whether a request is outstanding afterwards.
    pub(crate) fn arm<D: KmsDevice>(&self, device: &D) -> bool {
        if self.armed.swap(true, Ordering::AcqRel) {
            return true;
        }
        self.rearm(device)
    }

    /// Follow up a delivered vblank with the request for the next one
    pub(crate) fn rearm<D: KmsDevice>(&self, device: &D) -> bool {
        match device.request_vblank(self.index, self.pipe) {
            Ok(()) => {
                self.armed.store(true, Ordering::Release);
                true
            }
            Err(err) => {
                self.armed.store(false, Ordering::Release);
                warn!(
                    display = ?self.index,
                    errno = ?err.raw_os_error(),
                    "Failed to request vsync, retrying after the next mode-set"
                );
                false
            }
        }
    }
}

/// One bound output slot of the device
#[derive(Debug)]
pub struct Display<D: KmsDevice> {
    shared: Arc<DisplayShared>,
    connector: connector::Handle,
    encoder: encoder::Handle,
    crtc: crtc::Handle,
    connected: bool,
    mode: Option<Mode>,
    size_mm: Option<(u32, u32)>,
    overlays_allowed: bool,
    primary_fb: Option<ScanoutFramebuffer<D>>,
    overlay_fbs: HashMap<plane::Handle, ScanoutFramebuffer<D>>,
    span: tracing::Span,
}

impl<D: KmsDevice> Display<D> {
    /// Bind the output slot of `index`
    ///
    /// Uses the connector and the crtc in the slot of the display and the first encoder of that
    /// connector able to drive the crtc. A disconnected connector is bound anyway, it just has no mode.
    pub fn initialize(
        device: &D,
        index: DisplayIndex,
        timeline: FenceTimeline,
        overlays_allowed: bool,
    ) -> Result<Self, InitError> {
        let span = info_span!("hwc_display", display = ?index);
        let _guard = span.enter();

        let slot = index.index();
        let resources = device.resources()?;
        let connector = *resources
            .connectors
            .get(slot)
            .ok_or(InitError::NoSuchDisplay(index))?;
        let info = device.connector_info(connector)?;

        let crtc = *resources
            .crtcs
            .get(slot)
            .ok_or(InitError::NoUsableEncoder(index))?;
        let mut encoder = None;
        for handle in &info.encoders {
            let encoder_info = device.encoder_info(*handle)?;
            if encoder_info.possible_crtcs & (1 << slot) != 0 {
                encoder = Some(*handle);
                break;
            }
        }
        let encoder = encoder.ok_or(InitError::NoUsableEncoder(index))?;

        let mode = if info.connected {
            Some(*info.modes.first().ok_or(InitError::NoMode(index))?)
        } else {
            None
        };

        if !timeline.is_native() && overlays_allowed {
            warn!("No native fence timeline, falling back to framebuffer composition");
        }
        let overlays_allowed = overlays_allowed && timeline.is_native();

        info!(
            ?connector,
            ?encoder,
            ?crtc,
            connected = info.connected,
            ?mode,
            "Initialized display"
        );
        drop(_guard);

        Ok(Display {
            shared: Arc::new(DisplayShared::new(index, slot as u32, timeline)),
            connector,
            encoder,
            crtc,
            connected: info.connected,
            mode,
            size_mm: info.size_mm,
            overlays_allowed,
            primary_fb: None,
            overlay_fbs: HashMap::new(),
            span,
        })
    }

    /// Display slot
    pub fn index(&self) -> DisplayIndex {
        self.shared.index
    }

    /// Bound connector
    pub fn connector(&self) -> connector::Handle {
        self.connector
    }

    /// Bound encoder
    pub fn encoder(&self) -> encoder::Handle {
        self.encoder
    }

    /// Bound crtc
    pub fn crtc(&self) -> crtc::Handle {
        self.crtc
    }

    /// Index of the bound crtc, as used in possible-crtc masks
    pub fn crtc_index(&self) -> u32 {
        self.shared.pipe
    }

    /// Connection state, as of bring-up or the last [`Display::refresh_connection`]
    pub fn is_connected(&self) -> bool {
        self.connected && self.mode.is_some()
    }

    /// Active mode
    pub fn mode(&self) -> Option<Mode> {
        self.mode
    }

    /// Physical size in millimeters as reported by the connector
    pub fn size_mm(&self) -> Option<(u32, u32)> {
        self.size_mm
    }

    /// Horizontal and vertical dots per thousand inches, 0 where the physical size is unknown
    pub fn dpi(&self) -> Option<(i32, i32)> {
        let (w, h) = self.mode?.size();
        let (mm_w, mm_h) = self.size_mm.unwrap_or((0, 0));
        Some((dots_per_kilo_inch(w, mm_w), dots_per_kilo_inch(h, mm_h)))
    }

    /// Whether overlay planes may be used on this display
    pub fn overlays_allowed(&self) -> bool {
        self.overlays_allowed
    }

    /// Fence timeline of this display
    pub fn timeline(&self) -> &FenceTimeline {
        &self.shared.timeline
    }

    /// Whether vsync events are delivered to the observer
    pub fn vsync_enabled(&self) -> bool {
        self.shared.vsync_enabled()
    }

    pub(crate) fn set_vsync_enabled(&self, enabled: bool) {
        let _guard = self.span.enter();
        debug!(enabled, "Setting vsync delivery");
        self.shared.set_vsync_enabled(enabled);
    }

    /// Whether a vblank request of this display is outstanding
    pub fn is_vblank_armed(&self) -> bool {
        self.shared.is_armed()
    }

    /// Make sure the vsync thread gets the next vblank of this display
    pub(crate) fn arm_vblank(&self, device: &D) -> bool {
        self.shared.arm(device)
    }

    pub(crate) fn shared(&self) -> Arc<DisplayShared> {
        self.shared.clone()
    }

    pub(crate) fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Framebuffer currently shown by the crtc
    pub fn primary_framebuffer(&self) -> Option<&ScanoutFramebuffer<D>> {
        self.primary_fb.as_ref()
    }

    /// Planes currently showing a framebuffer
    pub fn active_planes(&self) -> impl Iterator<Item = plane::Handle> + '_ {
        self.overlay_fbs.keys().copied()
    }

    /// Re-query the connector
    ///
    /// Returns the new connection state. A connector that reports a sink but no mode counts as
    /// disconnected.
    #[instrument(level = "debug", parent = &self.span, skip(self, device))]
    pub fn refresh_connection(&mut self, device: &D) -> Result<bool, AccessError> {
        let info = device.connector_info(self.connector)?;
        let was_connected = self.is_connected();

        self.connected = info.connected;
        self.size_mm = info.size_mm;
        self.mode = if info.connected {
            // keep the active mode as long as the sink still advertises it
            match self.mode {
                Some(mode) if info.modes.contains(&mode) => Some(mode),
                _ => info.modes.first().copied(),
            }
        } else {
            None
        };
        if self.connected && self.mode.is_none() {
            warn!("Connector reports a sink without modes");
        }

        let connected = self.is_connected();
        if connected != was_connected {
            info!(connected, mode = ?self.mode, "Connection state changed");
        }
        Ok(connected)
    }

    /// Take ownership of the framebuffer the crtc now shows, releasing the previous one
    pub(crate) fn replace_primary_framebuffer(&mut self, fb: ScanoutFramebuffer<D>) {
        self.primary_fb = Some(fb);
    }

    /// Take ownership of the framebuffer `plane` now shows, releasing the previous one
    pub(crate) fn replace_overlay_framebuffer(&mut self, plane: plane::Handle, fb: ScanoutFramebuffer<D>) {
        self.overlay_fbs.insert(plane, fb);
    }

    /// Disable every plane that showed a framebuffer before but is not in `used`
    pub(crate) fn retire_overlays(&mut self, device: &D, used: &[plane::Handle]) {
        let _guard = self.span.enter();
        let stale = self
            .overlay_fbs
            .keys()
            .filter(|plane| !used.contains(plane))
            .copied()
            .collect::<Vec<_>>();
        for plane in stale {
            match device.program_plane(plane, self.crtc, None, Default::default(), Default::default()) {
                Ok(()) => {
                    debug!(?plane, "Disabled unused plane");
                    self.overlay_fbs.remove(&plane);
                }
                Err(err) => warn!(?plane, ?err, "Failed to disable unused plane"),
            }
        }
    }

    /// Stop scanning out from this display and release every framebuffer it owns
    ///
    /// Safe to call more than once.
    pub fn teardown(&mut self, device: &D) {
        let span = self.span.clone();
        let _guard = span.enter();
        if self.primary_fb.is_none() && self.overlay_fbs.is_empty() {
            return;
        }
        self.retire_overlays(device, &[]);
        // framebuffers of planes that refused to turn off are released anyway
        self.overlay_fbs.clear();
        self.primary_fb = None;
        self.set_vsync_enabled(false);
        info!("Display torn down");
    }
}
