//! Composition scheduler
//!
//! [`Composer`] is the interface the window-compositing client drives, once per frame:
//!
//! 1. [`Composer::classify`] decides for every layer of every display whether it is scanned out from
//!    an overlay plane or composed by the client into the framebuffer target.
//! 2. The client renders the framebuffer layers into the framebuffer target.
//! 3. [`Composer::realize`] programs the crtc and the overlay planes and hands out release fences.
//!
//! Frames are passed as one optional [`DisplayContents`] per display slot, indexed by
//! [`DisplayIndex`]. Displays without contents, absent or disconnected displays are skipped.
//!
//! [`HwComposer`] implements the protocol on top of any [`KmsDevice`].

use std::fmt::{self, Write as _};
use std::io;
use std::os::unix::io::AsFd;
use std::sync::Arc;

use drm::control::plane;
use drm_fourcc::DrmFourcc;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::ComposerConfig;
use crate::device::{DrmDeviceFd, ImportedBuffer, KmsDevice, Mode, ObjectRef, ScanoutFramebuffer};
use crate::display::{Display, DisplayIndex};
use crate::error::{AccessError, Error, InitError};
use crate::format::{fourcc_for, ScanoutLayout};
use crate::layer::{CompositionType, DisplayContents, Layer};
use crate::planes::{self, PlaneClaims};
use crate::sync::{wait_sync_file, FenceTimeline, SwSyncTimeline, SyncTimeline};
use crate::vsync::{ObserverSlot, VsyncNotifier, VsyncObserver};

/// The only display configuration
pub const DEFAULT_CONFIG: u32 = 1;

/// zpos of the lowest overlay plane, the crtc's primary plane sits below
pub const FIRST_OVERLAY_ZPOS: u64 = 1;

const FALLBACK_REFRESH: u32 = 60;

/// Device wide properties answered by [`Composer::query`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Whether a solid background layer is supported, always 0
    BackgroundLayerSupported,
    /// Vsync period of the primary display in nanoseconds
    VsyncPeriod,
    /// Mask of [`DisplayIndex::bit`] of every connected display
    DisplayTypesSupported,
}

/// Per-display properties answered by [`Composer::display_attributes`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisplayAttribute {
    /// Vsync period in nanoseconds
    VsyncPeriod,
    /// Width in pixels
    Width,
    /// Height in pixels
    Height,
    /// Horizontal dots per thousand inches, 0 if unknown
    DpiX,
    /// Vertical dots per thousand inches, 0 if unknown
    DpiY,
}

/// Power state of a display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerMode {
    /// Scanning out
    On,
    /// Powered down
    Off,
}

impl PowerMode {
    fn dpms(self) -> u64 {
        match self {
            PowerMode::On => 0,  /*DRM_MODE_DPMS_ON*/
            PowerMode::Off => 3, /*DRM_MODE_DPMS_OFF*/
        }
    }
}

/// A hardware composer
pub trait Composer {
    /// Decide the composition type of every layer
    fn classify(&mut self, contents: &mut [Option<DisplayContents>]) -> Result<(), Error>;

    /// Show the classified layers and fill in release and retire fences
    fn realize(&mut self, contents: &mut [Option<DisplayContents>]) -> Result<(), Error>;

    /// Enable or disable delivery of vertical blanks of `display` to the observer
    fn set_vsync_enabled(&self, display: DisplayIndex, enabled: bool) -> Result<(), Error>;

    /// Query a device wide property
    fn query(&self, capability: Capability) -> i64;

    /// Configuration ids of a connected display
    fn display_configs(&self, display: DisplayIndex) -> Result<Vec<u32>, Error>;

    /// Values of `attributes`, in order, for one configuration of a connected display
    fn display_attributes(
        &self,
        display: DisplayIndex,
        config: u32,
        attributes: &[DisplayAttribute],
    ) -> Result<Vec<i64>, Error>;

    /// Power a connected display on or off
    fn set_power_state(&mut self, display: DisplayIndex, mode: PowerMode) -> Result<(), Error>;

    /// Register the receiver of vertical blanks, replacing any earlier one
    fn register_vsync_observer(&mut self, observer: Arc<dyn VsyncObserver>);

    /// Human-readable description of the current state
    fn dump(&self) -> String;

    /// Tear down every display and release the device
    fn close(self)
    where
        Self: Sized;
}

fn vsync_period(refresh: u32) -> i64 {
    let refresh = if refresh == 0 { FALLBACK_REFRESH } else { refresh };
    1_000_000_000 / refresh as i64
}

fn programming_error(err: AccessError) -> Error {
    error!(errno = ?err.raw_os_error(), "{}", err);
    Error::Programming(err)
}

fn open_timeline<F>(factory: &F) -> FenceTimeline
where
    F: Fn() -> io::Result<Box<dyn SyncTimeline>>,
{
    match factory() {
        Ok(native) => FenceTimeline::new(Some(native)),
        Err(err) => {
            warn!(?err, "No native sync timeline available");
            FenceTimeline::software()
        }
    }
}

fn native_timeline() -> io::Result<Box<dyn SyncTimeline>> {
    Ok(Box::new(SwSyncTimeline::open()?))
}

/// The hardware composer of one display device
pub struct HwComposer<D: KmsDevice> {
    device: Arc<D>,
    config: ComposerConfig,
    displays: [Option<Display<D>>; 2],
    claims: PlaneClaims,
    observer: ObserverSlot,
    vsync: Option<VsyncNotifier>,
}

impl<D: KmsDevice> fmt::Debug for HwComposer<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HwComposer")
            .field("device", &self.device)
            .field("config", &self.config)
            .field("displays", &self.displays)
            .field("vsync", &self.vsync)
            .finish_non_exhaustive()
    }
}

impl HwComposer<DrmDeviceFd> {
    /// Open the first device driven by one of the configured drivers and bring up its displays
    pub fn open(config: ComposerConfig) -> Result<Self, InitError> {
        let (device, driver) = DrmDeviceFd::open_driver(config.drivers.as_slice())?;
        info!(%driver, "Using drm driver");
        HwComposer::new(Arc::new(device), config)
    }
}

impl<D: KmsDevice> HwComposer<D> {
    /// Bring up the displays of `device` and start the vsync thread
    ///
    /// Fence timelines are backed by the kernel software sync timeline when available.
    pub fn new(device: Arc<D>, config: ComposerConfig) -> Result<Self, InitError> {
        Self::with_timeline_factory(device, config, native_timeline)
    }

    /// Like [`HwComposer::new`], creating the native timeline of each display with `factory`
    ///
    /// A display whose timeline cannot be created falls back to framebuffer composition.
    /// The primary display is required, a missing external display is not an error.
    pub fn with_timeline_factory<F>(device: Arc<D>, config: ComposerConfig, factory: F) -> Result<Self, InitError>
    where
        F: Fn() -> io::Result<Box<dyn SyncTimeline>>,
    {
        let primary = Display::initialize(&*device, DisplayIndex::Primary, open_timeline(&factory), true)?;
        let external = match Display::initialize(
            &*device,
            DisplayIndex::External,
            open_timeline(&factory),
            config.external_overlays,
        ) {
            Ok(display) => Some(display),
            Err(err) => {
                info!("No external display: {}", err);
                None
            }
        };

        let displays = [Some(primary), external];
        let observer = ObserverSlot::default();
        let vsync = VsyncNotifier::spawn(
            device.clone(),
            displays.iter().flatten().map(|d| d.shared()).collect(),
            observer.clone(),
            config.vsync_wait_timeout,
            config.vsync_priority,
        )
        .map_err(InitError::EventThread)?;

        Ok(HwComposer {
            device,
            config,
            displays,
            claims: PlaneClaims::new(),
            observer,
            vsync: Some(vsync),
        })
    }

    /// The underlying device
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// The configuration in use
    pub fn config(&self) -> &ComposerConfig {
        &self.config
    }

    /// A bound display, `None` if the slot has no usable output
    pub fn display(&self, display: DisplayIndex) -> Option<&Display<D>> {
        self.displays[display.index()].as_ref()
    }

    /// Whether vertical blanks are still being delivered
    pub fn is_vsync_running(&self) -> bool {
        self.vsync.as_ref().map(|v| v.is_running()).unwrap_or(false)
    }

    /// Re-query the connection state of a display, returns whether it is connected now
    pub fn refresh_connection(&mut self, display: DisplayIndex) -> Result<bool, Error> {
        let slot = self.displays[display.index()]
            .as_mut()
            .ok_or(Error::NoSuchDisplay(display))?;
        slot.refresh_connection(&*self.device).map_err(Error::from)
    }

    fn connected_display(&self, display: DisplayIndex) -> Result<&Display<D>, Error> {
        let slot = self.display(display).ok_or(Error::NoSuchDisplay(display))?;
        if !slot.is_connected() {
            return Err(Error::Disconnected(display));
        }
        Ok(slot)
    }
}

#[instrument(level = "trace", parent = display.span(), skip_all)]
fn realize_display<D: KmsDevice>(
    device: &Arc<D>,
    config: &ComposerConfig,
    display: &mut Display<D>,
    contents: &mut DisplayContents,
) -> Result<(), Error> {
    let Some(mode) = display.mode().filter(|_| display.is_connected()) else {
        return Ok(());
    };

    // every scanned out buffer is checked before the hardware is touched
    let mut scanout = Vec::new();
    for (idx, layer) in contents.layers.iter().enumerate() {
        if !matches!(
            layer.composition,
            CompositionType::Overlay | CompositionType::FramebufferTarget
        ) {
            continue;
        }
        let Some(buffer) = layer.buffer.as_ref() else {
            trace!(layer = idx, "skipping layer without buffer");
            continue;
        };
        let fourcc = fourcc_for(buffer.format()).ok_or(Error::UnsupportedFormat(buffer.format()))?;
        if !buffer.is_allocator_backed() {
            error!(layer = idx, "Buffer is not backed by the expected allocator");
            return Err(Error::ForeignBuffer(display.index()));
        }
        scanout.push((idx, fourcc));
    }

    let mut zpos = FIRST_OVERLAY_ZPOS;
    let mut used_planes = Vec::new();
    let mut shown = Vec::new();
    for (idx, fourcc) in scanout {
        let layer = &mut contents.layers[idx];
        match realize_layer(device, config, display, layer, fourcc, &mode, &mut zpos) {
            Ok(LayerOutcome::Crtc) => shown.push(idx),
            Ok(LayerOutcome::Plane(plane)) => {
                used_planes.push(plane);
                shown.push(idx);
            }
            Ok(LayerOutcome::Skipped) => {}
            Err(err) => {
                // layers programmed so far are on screen now and must not be reused early
                if !shown.is_empty() {
                    let fence = display.timeline().mint(config.fence_delay);
                    for idx in shown {
                        contents.layers[idx].release_fence = Some(fence.clone());
                    }
                    warn!(point = fence.point(), "Frame only partially realized");
                    contents.retire_fence = Some(fence);
                }
                return Err(err);
            }
        }
    }

    display.retire_overlays(&**device, &used_planes);

    let fence = display
        .timeline()
        .bind_release_fences(contents, config.fence_delay);
    trace!(point = fence.point(), "Frame realized");
    Ok(())
}

enum LayerOutcome {
    Crtc,
    Plane(plane::Handle),
    Skipped,
}

fn realize_layer<D: KmsDevice>(
    device: &Arc<D>,
    config: &ComposerConfig,
    display: &mut Display<D>,
    layer: &mut Layer,
    fourcc: DrmFourcc,
    mode: &Mode,
    zpos: &mut u64,
) -> Result<LayerOutcome, Error> {
    let Some(buffer) = layer.buffer.clone() else {
        return Ok(LayerOutcome::Skipped);
    };

    if let Some(fence) = layer.acquire_fence.take() {
        if let Err(err) = wait_sync_file(fence.as_fd(), config.acquire_timeout) {
            warn!(?err, "Acquire fence not signaled, using the buffer anyway");
        }
    }

    let fb = {
        let imported = ImportedBuffer::import(&**device, buffer.fd()).map_err(programming_error)?;
        let layout = ScanoutLayout::new(fourcc, buffer.width(), buffer.height(), imported.handle());
        ScanoutFramebuffer::register(device, &layout).map_err(programming_error)?
    };

    if layer.composition == CompositionType::FramebufferTarget {
        device
            .program_crtc(display.crtc(), fb.handle(), display.connector(), mode)
            .map_err(programming_error)?;
        debug!(fb = ?fb.handle(), "Programmed crtc");
        display.replace_primary_framebuffer(fb);
        // the crtc is active now, vblank requests are accepted
        display.arm_vblank(&**device);
        *zpos += 1;
        return Ok(LayerOutcome::Crtc);
    }

    let Some(plane) = layer.plane() else {
        warn!("Overlay layer was not classified onto a plane");
        return Ok(LayerOutcome::Skipped);
    };
    match device.set_named_property(ObjectRef::Plane(plane), "zpos", *zpos) {
        Ok(true) => {}
        Ok(false) => warn!(?plane, "Plane has no zpos property"),
        Err(err) => warn!(?plane, ?err, "Failed to set zpos"),
    }
    *zpos += 1;

    device
        .program_plane(
            plane,
            display.crtc(),
            Some(fb.handle()),
            layer.display_frame,
            layer.source_crop,
        )
        .map_err(programming_error)?;
    debug!(?plane, fb = ?fb.handle(), "Programmed plane");
    display.replace_overlay_framebuffer(plane, fb);
    Ok(LayerOutcome::Plane(plane))
}

impl<D: KmsDevice> Composer for HwComposer<D> {
    #[profiling::function]
    fn classify(&mut self, contents: &mut [Option<DisplayContents>]) -> Result<(), Error> {
        self.claims.reset();

        let mut result = Ok(());
        for (idx, slot) in contents.iter_mut().enumerate() {
            let Some(contents) = slot.as_mut() else {
                continue;
            };
            let Some(display) = self.displays.get(idx).and_then(|d| d.as_ref()) else {
                continue;
            };
            if !display.is_connected() {
                continue;
            }

            let classified = if display.overlays_allowed() {
                planes::classify(&*self.device, display, contents, &mut self.claims)
            } else {
                let mut none = PlaneClaims::new();
                none.claim_all();
                planes::classify(&*self.device, display, contents, &mut none)
            };
            if let Err(err) = classified {
                let index = display.index();
                warn!(display = ?index, "Classification failed: {}", err);
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    #[profiling::function]
    fn realize(&mut self, contents: &mut [Option<DisplayContents>]) -> Result<(), Error> {
        let mut result = Ok(());
        for (idx, slot) in contents.iter_mut().enumerate() {
            let Some(contents) = slot.as_mut() else {
                continue;
            };
            let Some(display) = self.displays.get_mut(idx).and_then(|d| d.as_mut()) else {
                continue;
            };
            if let Err(err) = realize_display(&self.device, &self.config, display, contents) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    fn set_vsync_enabled(&self, display: DisplayIndex, enabled: bool) -> Result<(), Error> {
        self.display(display)
            .ok_or(Error::NoSuchDisplay(display))?
            .set_vsync_enabled(enabled);
        Ok(())
    }

    fn query(&self, capability: Capability) -> i64 {
        match capability {
            Capability::BackgroundLayerSupported => 0,
            Capability::VsyncPeriod => vsync_period(
                self.display(DisplayIndex::Primary)
                    .and_then(|d| d.mode())
                    .map(|mode| mode.vrefresh())
                    .unwrap_or(FALLBACK_REFRESH),
            ),
            Capability::DisplayTypesSupported => self
                .displays
                .iter()
                .flatten()
                .filter(|d| d.is_connected())
                .fold(0, |mask, d| mask | d.index().bit() as i64),
        }
    }

    fn display_configs(&self, display: DisplayIndex) -> Result<Vec<u32>, Error> {
        self.connected_display(display)?;
        Ok(vec![DEFAULT_CONFIG])
    }

    fn display_attributes(
        &self,
        display: DisplayIndex,
        config: u32,
        attributes: &[DisplayAttribute],
    ) -> Result<Vec<i64>, Error> {
        let display = self.connected_display(display)?;
        if config != DEFAULT_CONFIG {
            return Err(Error::InvalidConfig(config));
        }
        let mode = display.mode().ok_or(Error::Disconnected(display.index()))?;
        let (width, height) = mode.size();
        let (dpi_x, dpi_y) = display.dpi().unwrap_or((0, 0));

        Ok(attributes
            .iter()
            .map(|attribute| match attribute {
                DisplayAttribute::VsyncPeriod => vsync_period(mode.vrefresh()),
                DisplayAttribute::Width => width as i64,
                DisplayAttribute::Height => height as i64,
                DisplayAttribute::DpiX => dpi_x as i64,
                DisplayAttribute::DpiY => dpi_y as i64,
            })
            .collect())
    }

    fn set_power_state(&mut self, display: DisplayIndex, mode: PowerMode) -> Result<(), Error> {
        let display = self.connected_display(display)?;
        let _guard = display.span().enter();
        let found = self
            .device
            .set_named_property(ObjectRef::Connector(display.connector()), "DPMS", mode.dpms())
            .map_err(programming_error)?;
        if found {
            info!(?mode, "Set power state");
        } else {
            warn!("Connector has no DPMS property");
        }
        Ok(())
    }

    fn register_vsync_observer(&mut self, observer: Arc<dyn VsyncObserver>) {
        self.observer.register(observer);
    }

    fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "hwcomposer-drm: vsync thread {}",
            if self.is_vsync_running() { "running" } else { "stopped" }
        );
        for index in DisplayIndex::ALL {
            let Some(display) = self.display(index) else {
                let _ = writeln!(out, "  {:?}: absent", index);
                continue;
            };
            let mode = display
                .mode()
                .map(|m| format!("{}x{}@{}", m.size().0, m.size().1, m.vrefresh()))
                .unwrap_or_else(|| "no mode".into());
            let _ = writeln!(
                out,
                "  {:?}: {}, {}, crtc {}, overlays {}, vsync {}",
                index,
                if display.is_connected() { "connected" } else { "disconnected" },
                mode,
                display.crtc_index(),
                if display.overlays_allowed() { "allowed" } else { "disabled" },
                if display.vsync_enabled() { "on" } else { "off" },
            );
            let _ = writeln!(
                out,
                "    timeline at {} ({}), planes in use: {:?}",
                display.timeline().signaled(),
                if display.timeline().is_native() { "native" } else { "software" },
                display.active_planes().collect::<Vec<_>>(),
            );
        }
        out
    }

    fn close(self) {
        drop(self);
    }
}

impl<D: KmsDevice> Drop for HwComposer<D> {
    fn drop(&mut self) {
        if let Some(mut vsync) = self.vsync.take() {
            vsync.stop();
        }
        for display in self.displays.iter_mut().flatten() {
            display.teardown(&*self.device);
        }
        info!("Composer closed");
    }
}

#[cfg(test)]
mod tests {
    use super::{Capability, Composer, DisplayAttribute, HwComposer, PowerMode};
    use crate::buffer::tests::{buffer, buffer_with_flags};
    use crate::buffer::BufferFlags;
    use crate::config::ComposerConfig;
    use crate::device::test::{Operation, TestDevice, TestOutput};
    use crate::device::{Mode, ObjectRef};
    use crate::display::DisplayIndex;
    use crate::error::Error;
    use crate::format::PixelFormat;
    use crate::layer::{CompositionType, DisplayContents, Layer};
    use crate::sync::tests::CountingTimeline;
    use crate::sync::SyncTimeline;
    use crate::utils::Rectangle;
    use drm::control::plane;
    use drm_fourcc::DrmFourcc;
    use rustix::event::{eventfd, EventfdFlags};
    use std::io;
    use std::sync::{mpsc, Arc};
    use std::time::Duration;

    struct Setup {
        device: Arc<TestDevice>,
        primary: TestOutput,
        external: TestOutput,
        planes: Vec<plane::Handle>,
        composer: HwComposer<TestDevice>,
    }

    fn setup_with(primary_mm: Option<(u32, u32)>, config: ComposerConfig) -> Setup {
        let device = TestDevice::new().unwrap();
        let primary = device.add_output(Some(Mode::new(1920, 1080, 60)), primary_mm, true);
        let external = device.add_output(Some(Mode::new(1280, 720, 50)), Some((600, 340)), false);
        let planes = vec![
            device.add_plane(0b01, &[DrmFourcc::Abgr8888, DrmFourcc::Nv12], true),
            device.add_plane(0b11, &[DrmFourcc::Abgr8888], true),
        ];
        let device = Arc::new(device);
        let timeline = Arc::new(CountingTimeline::default());
        let composer = HwComposer::with_timeline_factory(device.clone(), config, move || {
            Ok(Box::new(timeline.clone()) as Box<dyn SyncTimeline>)
        })
        .unwrap();
        Setup {
            device,
            primary,
            external,
            planes,
            composer,
        }
    }

    fn setup() -> Setup {
        setup_with(Some((508, 286)), ComposerConfig::default())
    }

    fn layer(format: PixelFormat) -> Layer {
        Layer::new(
            buffer(256, 128, format),
            Rectangle::new((0, 0), (256, 128)),
            Rectangle::new((100, 50), (256, 128)),
        )
    }

    fn target() -> Layer {
        Layer::framebuffer_target(buffer(1920, 1080, PixelFormat::RGBA_8888))
    }

    fn primary_frame(layers: Vec<Layer>) -> Vec<Option<DisplayContents>> {
        vec![Some(DisplayContents::new(layers)), None]
    }

    fn added_framebuffers(ops: &[Operation]) -> Vec<drm::control::framebuffer::Handle> {
        ops.iter()
            .filter_map(|op| match op {
                Operation::AddFramebuffer { fb, .. } => Some(*fb),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn overlay_above_composed_layer() {
        let mut s = setup();
        let mut overlay = layer(PixelFormat::RGBA_8888);
        overlay.acquire_fence = Some(eventfd(1, EventfdFlags::CLOEXEC).unwrap());
        let mut frame = primary_frame(vec![layer(PixelFormat::BLOB), overlay, target()]);

        s.composer.classify(&mut frame).unwrap();
        let contents = frame[0].as_ref().unwrap();
        assert_eq!(contents.layers[0].composition, CompositionType::Framebuffer);
        assert_eq!(contents.layers[1].composition, CompositionType::Overlay);
        assert_eq!(contents.layers[1].plane(), Some(s.planes[0]));
        assert_eq!(contents.layers[2].composition, CompositionType::FramebufferTarget);

        s.device.take_operations();
        s.composer.realize(&mut frame).unwrap();
        let ops = s.device.take_operations();
        let fbs = added_framebuffers(&ops);
        assert_eq!(fbs.len(), 2);

        assert!(ops.contains(&Operation::SetProperty {
            object: ObjectRef::Plane(s.planes[0]),
            name: "zpos".into(),
            value: 1,
        }));
        assert!(ops.contains(&Operation::SetPlane {
            plane: s.planes[0],
            crtc: s.primary.crtc,
            fb: Some(fbs[0]),
            dst: Rectangle::new((100, 50), (256, 128)),
            src: (0, 0, 256 << 16, 128 << 16),
        }));
        assert!(ops.contains(&Operation::SetCrtc {
            crtc: s.primary.crtc,
            fb: fbs[1],
            connector: s.primary.connector,
        }));
        // buffer handles are closed once the framebuffers exist
        assert_eq!(s.device.live_buffers(), 0);
        assert_eq!(s.device.live_framebuffers(), 2);

        let contents = frame[0].as_ref().unwrap();
        let retire = contents.retire_fence.clone().unwrap();
        assert!(contents.layers[0].release_fence.is_none());
        assert_eq!(contents.layers[1].release_fence.as_ref(), Some(&retire));
        assert_eq!(contents.layers[2].release_fence.as_ref(), Some(&retire));
        assert!(contents.layers[1].acquire_fence.is_none());
        assert!(retire.is_exportable());
    }

    #[test]
    fn disconnected_external_display_is_a_noop() {
        let mut s = setup();
        s.device.take_operations();

        let mut frame = vec![
            None,
            Some(DisplayContents::new(vec![layer(PixelFormat::RGBA_8888), target()])),
        ];
        s.composer.classify(&mut frame).unwrap();
        s.composer.realize(&mut frame).unwrap();

        assert!(s.device.operations().is_empty());
        let contents = frame[1].as_ref().unwrap();
        assert_eq!(contents.layers[0].composition, CompositionType::Framebuffer);
        assert!(contents.retire_fence.is_none());
    }

    #[test]
    fn external_display_composes_everything_by_default() {
        let mut s = setup();
        s.device.set_connected(s.external.connector, true);
        assert!(s.composer.refresh_connection(DisplayIndex::External).unwrap());

        let mut frame = vec![
            None,
            Some(DisplayContents::new(vec![layer(PixelFormat::RGBA_8888), target()])),
        ];
        s.composer.classify(&mut frame).unwrap();
        assert_eq!(frame[1].as_ref().unwrap().overlay_count(), 0);

        let config = ComposerConfig {
            external_overlays: true,
            ..Default::default()
        };
        let mut s = setup_with(None, config);
        s.device.set_connected(s.external.connector, true);
        s.composer.refresh_connection(DisplayIndex::External).unwrap();
        s.composer.classify(&mut frame).unwrap();
        let contents = frame[1].as_ref().unwrap();
        assert_eq!(contents.overlay_count(), 1);
        // only the second plane can be shown on the external crtc
        assert_eq!(contents.layers[0].plane(), Some(s.planes[1]));
    }

    #[test]
    fn planes_are_shared_between_displays() {
        let config = ComposerConfig {
            external_overlays: true,
            ..Default::default()
        };
        let mut s = setup_with(None, config);
        s.device.set_connected(s.external.connector, true);
        s.composer.refresh_connection(DisplayIndex::External).unwrap();

        let mut frame = vec![
            Some(DisplayContents::new(vec![
                layer(PixelFormat::RGBA_8888),
                layer(PixelFormat::RGBA_8888),
                target(),
            ])),
            Some(DisplayContents::new(vec![layer(PixelFormat::RGBA_8888), target()])),
        ];
        s.composer.classify(&mut frame).unwrap();
        assert_eq!(frame[0].as_ref().unwrap().overlay_count(), 2);
        assert_eq!(frame[1].as_ref().unwrap().overlay_count(), 0);

        // claims start over with every frame
        frame[0] = None;
        s.composer.classify(&mut frame).unwrap();
        assert_eq!(frame[1].as_ref().unwrap().overlay_count(), 1);
    }

    #[test]
    fn framebuffers_are_replaced_not_leaked() {
        let mut s = setup();
        for _ in 0..3 {
            let mut frame = primary_frame(vec![layer(PixelFormat::RGBA_8888), target()]);
            s.composer.classify(&mut frame).unwrap();
            s.composer.realize(&mut frame).unwrap();
            assert_eq!(s.device.live_framebuffers(), 2);
        }

        // the overlay layer goes away, its plane is turned off
        s.device.take_operations();
        let mut frame = primary_frame(vec![target()]);
        s.composer.classify(&mut frame).unwrap();
        s.composer.realize(&mut frame).unwrap();
        let ops = s.device.take_operations();
        assert!(ops.iter().any(|op| matches!(
            op,
            Operation::SetPlane { plane, fb: None, .. } if *plane == s.planes[0]
        )));
        assert_eq!(s.device.live_framebuffers(), 1);
        assert_eq!(s.device.live_buffers(), 0);
    }

    #[test]
    fn rejected_programming_keeps_previous_framebuffer() {
        let mut s = setup();
        let mut frame = primary_frame(vec![target()]);
        s.composer.classify(&mut frame).unwrap();
        s.composer.realize(&mut frame).unwrap();
        let shown = s
            .composer
            .display(DisplayIndex::Primary)
            .unwrap()
            .primary_framebuffer()
            .map(|fb| fb.handle());

        s.device.reject_programming(true);
        let mut frame = primary_frame(vec![target()]);
        s.composer.classify(&mut frame).unwrap();
        let err = s.composer.realize(&mut frame).unwrap_err();
        assert!(matches!(err, Error::Programming(_)));
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
        assert!(frame[0].as_ref().unwrap().retire_fence.is_none());

        let still_shown = s
            .composer
            .display(DisplayIndex::Primary)
            .unwrap()
            .primary_framebuffer()
            .map(|fb| fb.handle());
        assert_eq!(shown, still_shown);
        assert_eq!(s.device.live_framebuffers(), 1);
    }

    #[test]
    fn unusable_buffers_abort_the_frame() {
        let mut s = setup();

        let mut unmapped = layer(PixelFormat::IMPLEMENTATION_DEFINED);
        unmapped.composition = CompositionType::FramebufferTarget;
        let mut frame = primary_frame(vec![unmapped]);
        assert!(matches!(
            s.composer.realize(&mut frame),
            Err(Error::UnsupportedFormat(PixelFormat::IMPLEMENTATION_DEFINED))
        ));

        let foreign = buffer_with_flags(1920, 1080, PixelFormat::RGBA_8888, BufferFlags::FRAMEBUFFER);
        let mut frame = primary_frame(vec![Layer::framebuffer_target(foreign)]);
        assert!(matches!(
            s.composer.realize(&mut frame),
            Err(Error::ForeignBuffer(DisplayIndex::Primary))
        ));
        assert_eq!(s.device.live_framebuffers(), 0);
    }

    #[test]
    fn two_targets_fail_classification() {
        let mut s = setup();
        let mut frame = primary_frame(vec![target(), target()]);
        assert!(matches!(
            s.composer.classify(&mut frame),
            Err(Error::MultipleTargets(DisplayIndex::Primary))
        ));
    }

    #[test]
    fn invalid_layer_leaves_previous_frame_on_screen() {
        let mut s = setup();
        let mut frame = primary_frame(vec![layer(PixelFormat::RGBA_8888), target()]);
        s.composer.classify(&mut frame).unwrap();
        s.composer.realize(&mut frame).unwrap();
        assert_eq!(s.device.live_framebuffers(), 2);
        s.device.take_operations();

        let foreign = buffer_with_flags(1920, 1080, PixelFormat::RGBA_8888, BufferFlags::FRAMEBUFFER);
        let mut frame = primary_frame(vec![layer(PixelFormat::RGBA_8888), Layer::framebuffer_target(foreign)]);
        s.composer.classify(&mut frame).unwrap();
        assert_eq!(frame[0].as_ref().unwrap().overlay_count(), 1);
        assert!(matches!(
            s.composer.realize(&mut frame),
            Err(Error::ForeignBuffer(DisplayIndex::Primary))
        ));

        // nothing was imported or programmed, the old overlay still owns its framebuffer
        assert!(s.device.take_operations().is_empty());
        assert_eq!(s.device.live_framebuffers(), 2);
        let contents = frame[0].as_ref().unwrap();
        assert!(contents.layers[0].release_fence.is_none());
        assert!(contents.retire_fence.is_none());
    }

    #[test]
    fn partially_realized_frame_still_gets_fences() {
        let mut s = setup();
        s.device.reject_modeset(true);
        let mut frame = primary_frame(vec![layer(PixelFormat::RGBA_8888), target()]);
        s.composer.classify(&mut frame).unwrap();
        let err = s.composer.realize(&mut frame).unwrap_err();
        assert!(matches!(err, Error::Programming(_)));

        let ops = s.device.take_operations();
        assert!(ops.iter().any(|op| matches!(
            op,
            Operation::SetPlane { plane, fb: Some(_), .. } if *plane == s.planes[0]
        )));
        assert!(!ops.iter().any(|op| matches!(op, Operation::SetCrtc { .. })));
        // only the overlay is on screen
        assert_eq!(s.device.live_framebuffers(), 1);

        let contents = frame[0].as_ref().unwrap();
        let retire = contents.retire_fence.clone().unwrap();
        assert_eq!(contents.layers[0].release_fence.as_ref(), Some(&retire));
        assert!(contents.layers[1].release_fence.is_none());
        assert!(!retire.is_signaled());
    }

    #[test]
    fn vblanks_start_once_the_crtc_is_active() {
        let device = TestDevice::new().unwrap();
        device.add_output(Some(Mode::new(1920, 1080, 60)), None, true);
        let external = device.add_output(Some(Mode::new(1280, 720, 50)), None, false);
        device.require_active_crtc(true);
        let device = Arc::new(device);
        let timeline = Arc::new(CountingTimeline::default());
        let mut composer = HwComposer::with_timeline_factory(device.clone(), ComposerConfig::default(), move || {
            Ok(Box::new(timeline.clone()) as Box<dyn SyncTimeline>)
        })
        .unwrap();

        // no crtc scans out yet, the kernel refuses every request
        assert!(device.vblank_requests().is_empty());
        assert!(!composer.display(DisplayIndex::Primary).unwrap().is_vblank_armed());
        assert!(!composer.display(DisplayIndex::External).unwrap().is_vblank_armed());

        let mut frame = primary_frame(vec![target()]);
        composer.classify(&mut frame).unwrap();
        composer.realize(&mut frame).unwrap();
        assert!(composer.display(DisplayIndex::Primary).unwrap().is_vblank_armed());
        assert_eq!(device.vblank_requests(), vec![(DisplayIndex::Primary, 0)]);

        // an outstanding request is not issued twice
        let mut frame = primary_frame(vec![target()]);
        composer.realize(&mut frame).unwrap();
        assert_eq!(device.vblank_requests(), vec![(DisplayIndex::Primary, 0)]);

        let retire = frame[0].as_ref().unwrap().retire_fence.clone().unwrap();
        device
            .queue_vblank(DisplayIndex::Primary, 1, Duration::from_millis(16))
            .unwrap();
        retire.wait(Some(Duration::from_secs(5))).unwrap();

        // a display connected later is armed by its first mode-set
        device.set_connected(external.connector, true);
        assert!(composer.refresh_connection(DisplayIndex::External).unwrap());
        let mut frame = vec![
            None,
            Some(DisplayContents::new(vec![Layer::framebuffer_target(buffer(
                1280,
                720,
                PixelFormat::RGBA_8888,
            ))])),
        ];
        composer.realize(&mut frame).unwrap();
        assert!(composer.display(DisplayIndex::External).unwrap().is_vblank_armed());
        assert!(device.vblank_requests().contains(&(DisplayIndex::External, 1)));

        let retire = frame[1].as_ref().unwrap().retire_fence.clone().unwrap();
        device
            .queue_vblank(DisplayIndex::External, 1, Duration::from_millis(20))
            .unwrap();
        retire.wait(Some(Duration::from_secs(5))).unwrap();
    }

    #[test]
    fn pending_acquire_fence_does_not_block_the_frame() {
        let config = ComposerConfig {
            acquire_timeout: Duration::from_millis(10),
            ..Default::default()
        };
        let mut s = setup_with(None, config);
        let mut target = target();
        target.acquire_fence = Some(eventfd(0, EventfdFlags::CLOEXEC).unwrap());
        let mut frame = primary_frame(vec![target]);
        s.composer.classify(&mut frame).unwrap();
        s.composer.realize(&mut frame).unwrap();
        assert!(frame[0].as_ref().unwrap().retire_fence.is_some());
    }

    #[test]
    fn semi_planar_layout() {
        let mut s = setup();
        let mut frame = primary_frame(vec![layer(PixelFormat::YV12), target()]);
        s.composer.classify(&mut frame).unwrap();
        s.device.take_operations();
        s.composer.realize(&mut frame).unwrap();

        let nv12 = s.device.operations().into_iter().find_map(|op| match op {
            Operation::AddFramebuffer {
                format: DrmFourcc::Nv12,
                pitches,
                offsets,
                ..
            } => Some((pitches, offsets)),
            _ => None,
        });
        let (pitches, offsets) = nv12.unwrap();
        assert_eq!(pitches[..2], [256, 256]);
        assert_eq!(offsets[1], 256 * 128);
    }

    #[test]
    fn attributes() {
        let s = setup();
        let values = s
            .composer
            .display_attributes(
                DisplayIndex::Primary,
                1,
                &[
                    DisplayAttribute::Width,
                    DisplayAttribute::Height,
                    DisplayAttribute::VsyncPeriod,
                    DisplayAttribute::DpiX,
                    DisplayAttribute::DpiY,
                ],
            )
            .unwrap();
        assert_eq!(values, vec![1920, 1080, 16_666_666, 96_000, 95_916]);
        assert_eq!(s.composer.display_configs(DisplayIndex::Primary).unwrap(), vec![1]);

        assert!(matches!(
            s.composer
                .display_attributes(DisplayIndex::Primary, 2, &[DisplayAttribute::Width]),
            Err(Error::InvalidConfig(2))
        ));
        assert!(matches!(
            s.composer
                .display_attributes(DisplayIndex::External, 1, &[DisplayAttribute::Width]),
            Err(Error::Disconnected(DisplayIndex::External))
        ));
        assert!(s.composer.display_configs(DisplayIndex::External).is_err());
    }

    #[test]
    fn dpi_without_physical_size() {
        let s = setup_with(Some((0, 0)), ComposerConfig::default());
        let values = s
            .composer
            .display_attributes(
                DisplayIndex::Primary,
                1,
                &[DisplayAttribute::DpiX, DisplayAttribute::DpiY],
            )
            .unwrap();
        assert_eq!(values, vec![0, 0]);
    }

    #[test]
    fn queries() {
        let mut s = setup();
        assert_eq!(s.composer.query(Capability::BackgroundLayerSupported), 0);
        assert_eq!(s.composer.query(Capability::VsyncPeriod), 16_666_666);
        assert_eq!(s.composer.query(Capability::DisplayTypesSupported), 0b01);

        s.device.set_connected(s.external.connector, true);
        s.composer.refresh_connection(DisplayIndex::External).unwrap();
        assert_eq!(s.composer.query(Capability::DisplayTypesSupported), 0b11);
        assert!(s.composer.dump().contains("External: connected, 1280x720@50"));
    }

    #[test]
    fn power_state() {
        let mut s = setup();
        s.device.take_operations();
        s.composer
            .set_power_state(DisplayIndex::Primary, PowerMode::Off)
            .unwrap();
        assert_eq!(
            s.device.take_operations(),
            vec![Operation::SetProperty {
                object: ObjectRef::Connector(s.primary.connector),
                name: "DPMS".into(),
                value: 3,
            }]
        );
        assert!(s
            .composer
            .set_power_state(DisplayIndex::External, PowerMode::On)
            .is_err());
    }

    #[test]
    fn vsync_reaches_registered_observer() {
        let mut s = setup();
        let (tx, rx) = mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        s.composer
            .register_vsync_observer(Arc::new(move |display: DisplayIndex, timestamp: i64| {
                let _ = tx.lock().unwrap().send((display, timestamp));
            }));

        // disabled: the timeline moves, the observer stays silent
        let fence = s.composer.display(DisplayIndex::Primary).unwrap().timeline().mint(1);
        s.device
            .queue_vblank(DisplayIndex::Primary, 1, Duration::from_secs(1))
            .unwrap();
        fence.wait(Some(Duration::from_secs(5))).unwrap();
        assert!(rx.try_recv().is_err());

        s.composer
            .set_vsync_enabled(DisplayIndex::Primary, true)
            .unwrap();
        s.device
            .queue_vblank(DisplayIndex::Primary, 2, Duration::from_secs(2))
            .unwrap();
        let (display, timestamp) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(display, DisplayIndex::Primary);
        assert_eq!(timestamp, 2_000_000_000);
        assert!(s.composer.is_vsync_running());
    }

    #[test]
    fn software_timeline_disables_overlays() {
        let device = TestDevice::new().unwrap();
        device.add_output(Some(Mode::new(1920, 1080, 60)), None, true);
        device.add_plane(0b01, &[DrmFourcc::Abgr8888], true);
        let mut composer = HwComposer::with_timeline_factory(Arc::new(device), ComposerConfig::default(), || {
            Err(io::Error::from(io::ErrorKind::NotFound))
        })
        .unwrap();

        let mut frame = primary_frame(vec![layer(PixelFormat::RGBA_8888), target()]);
        composer.classify(&mut frame).unwrap();
        assert_eq!(frame[0].as_ref().unwrap().overlay_count(), 0);
        assert!(composer.display(DisplayIndex::External).is_none());
    }

    #[test]
    fn close_releases_everything() {
        let mut s = setup();
        let mut frame = primary_frame(vec![layer(PixelFormat::RGBA_8888), target()]);
        s.composer.classify(&mut frame).unwrap();
        s.composer.realize(&mut frame).unwrap();
        assert_eq!(s.device.live_framebuffers(), 2);

        let device = s.device.clone();
        s.composer.close();
        assert_eq!(device.live_framebuffers(), 0);
    }
}
