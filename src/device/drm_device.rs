use std::io;
use std::os::unix::io::BorrowedFd;

use drm::buffer::Handle as BufferHandle;
use drm::control::{
    connector, crtc, encoder, framebuffer, plane, property, Device as ControlDevice, Event, FbCmd2Flags,
    ResourceHandle, ResourceHandles,
};
use drm::{Device as BasicDevice, VblankWaitFlags, VblankWaitTarget};
use tracing::trace;

use super::{
    ConnectorInfo, DrmDeviceFd, EncoderInfo, KmsDevice, Mode, ObjectRef, PlaneInfo, Resources, VblankEvent,
};
use crate::display::DisplayIndex;
use crate::error::AccessError;
use crate::format::ScanoutLayout;
use crate::utils::{Buffer, DevPath, Physical, Rectangle};

impl DrmDeviceFd {
    fn access_error(&self, errmsg: &'static str, source: io::Error) -> AccessError {
        AccessError {
            errmsg,
            dev: self.dev_path(),
            source,
        }
    }

    fn load_resources(&self) -> Result<ResourceHandles, AccessError> {
        self.resource_handles()
            .map_err(|source| self.access_error("Error loading drm resources", source))
    }

    // The kernel encodes possible crtcs as a bitmask over the crtc list order
    fn crtc_mask(crtcs: &[crtc::Handle], filtered: &[crtc::Handle]) -> u32 {
        crtcs
            .iter()
            .enumerate()
            .filter(|(_, crtc)| filtered.contains(crtc))
            .fold(0, |mask, (idx, _)| mask | (1 << idx))
    }

    fn find_property<T: ResourceHandle>(
        &self,
        handle: T,
        name: &str,
    ) -> Result<Option<property::Handle>, AccessError> {
        let props = self
            .get_properties(handle)
            .map_err(|source| self.access_error("Failed to get properties of object", source))?;
        let (handles, _) = props.as_props_and_values();
        for prop in handles {
            let info = self
                .get_property(*prop)
                .map_err(|source| self.access_error("Failed to get property info", source))?;
            if info.name().to_str().map(|x| x == name).unwrap_or(false) {
                return Ok(Some(*prop));
            }
        }
        Ok(None)
    }
}

impl KmsDevice for DrmDeviceFd {
    fn resources(&self) -> Result<Resources, AccessError> {
        let res = self.load_resources()?;
        Ok(Resources {
            connectors: res.connectors().to_vec(),
            crtcs: res.crtcs().to_vec(),
        })
    }

    fn connector_info(&self, handle: connector::Handle) -> Result<ConnectorInfo, AccessError> {
        let info = self
            .get_connector(handle, false)
            .map_err(|source| self.access_error("Error loading connector info", source))?;
        Ok(ConnectorInfo {
            handle,
            connected: info.state() == connector::State::Connected,
            modes: info.modes().iter().copied().map(Mode::from).collect(),
            encoders: info.encoders().to_vec(),
            size_mm: info.size(),
        })
    }

    fn encoder_info(&self, handle: encoder::Handle) -> Result<EncoderInfo, AccessError> {
        let res = self.load_resources()?;
        let info = self
            .get_encoder(handle)
            .map_err(|source| self.access_error("Error loading encoder info", source))?;
        let filtered = res.filter_crtcs(info.possible_crtcs());
        Ok(EncoderInfo {
            handle,
            possible_crtcs: Self::crtc_mask(res.crtcs(), &filtered),
        })
    }

    fn planes(&self) -> Result<Vec<plane::Handle>, AccessError> {
        self.plane_handles()
            .map_err(|source| self.access_error("Error loading planes", source))
    }

    fn plane_info(&self, handle: plane::Handle) -> Result<PlaneInfo, AccessError> {
        let res = self.load_resources()?;
        let info = self
            .get_plane(handle)
            .map_err(|source| self.access_error("Error loading plane info", source))?;
        let filtered = res.filter_crtcs(info.possible_crtcs());
        Ok(PlaneInfo {
            handle,
            possible_crtcs: Self::crtc_mask(res.crtcs(), &filtered),
            formats: info.formats().to_vec(),
        })
    }

    fn import_buffer(&self, fd: BorrowedFd<'_>) -> Result<BufferHandle, AccessError> {
        self.prime_fd_to_buffer(fd)
            .map_err(|source| self.access_error("Failed to import dma-buf", source))
    }

    fn release_buffer(&self, handle: BufferHandle) -> Result<(), AccessError> {
        self.close_buffer(handle)
            .map_err(|source| self.access_error("Failed to close buffer handle", source))
    }

    fn register_framebuffer(&self, layout: &ScanoutLayout) -> Result<framebuffer::Handle, AccessError> {
        self.add_planar_framebuffer(layout, FbCmd2Flags::empty())
            .map_err(|source| self.access_error("Failed to add framebuffer", source))
    }

    fn remove_framebuffer(&self, fb: framebuffer::Handle) -> Result<(), AccessError> {
        self.destroy_framebuffer(fb)
            .map_err(|source| self.access_error("Failed to destroy framebuffer", source))
    }

    fn program_crtc(
        &self,
        crtc: crtc::Handle,
        fb: framebuffer::Handle,
        connector: connector::Handle,
        mode: &Mode,
    ) -> Result<(), AccessError> {
        let raw = mode.raw().ok_or_else(|| {
            self.access_error(
                "Mode was not read from this device",
                io::Error::from(io::ErrorKind::InvalidInput),
            )
        })?;
        trace!(?crtc, ?fb, ?connector, "Setting crtc");
        self.set_crtc(crtc, Some(fb), (0, 0), &[connector], Some(raw))
            .map_err(|source| self.access_error("Error setting crtc", source))
    }

    fn program_plane(
        &self,
        plane: plane::Handle,
        crtc: crtc::Handle,
        fb: Option<framebuffer::Handle>,
        dst: Rectangle<Physical>,
        src: Rectangle<Buffer>,
    ) -> Result<(), AccessError> {
        trace!(?plane, ?crtc, ?fb, ?dst, ?src, "Setting plane");
        self.set_plane(
            plane,
            crtc,
            fb,
            0,
            (dst.loc.x, dst.loc.y, dst.size.w as u32, dst.size.h as u32),
            src.to_fixed_16_16(),
        )
        .map_err(|source| self.access_error("Error setting plane", source))
    }

    fn set_named_property(&self, object: ObjectRef, name: &str, value: u64) -> Result<bool, AccessError> {
        let (prop, result) = match object {
            ObjectRef::Plane(handle) => match self.find_property(handle, name)? {
                Some(prop) => (prop, self.set_property(handle, prop, value)),
                None => return Ok(false),
            },
            ObjectRef::Connector(handle) => match self.find_property(handle, name)? {
                Some(prop) => (prop, self.set_property(handle, prop, value)),
                None => return Ok(false),
            },
        };
        trace!(?object, ?prop, name, value, "Set property");
        result
            .map(|_| true)
            .map_err(|source| self.access_error("Failed to set property", source))
    }

    fn request_vblank(&self, display: DisplayIndex, pipe: u32) -> Result<(), AccessError> {
        self.wait_vblank(
            VblankWaitTarget::Relative(1),
            VblankWaitFlags::EVENT,
            pipe,
            display.index(),
        )
        .map(|_| ())
        .map_err(|source| self.access_error("Failed to request vblank event", source))
    }

    fn receive_vblanks(&self) -> Result<Vec<VblankEvent>, AccessError> {
        let events = self
            .receive_events()
            .map_err(|source| self.access_error("Error processing drm events", source))?;

        let mut vblanks = Vec::new();
        for event in events {
            match event {
                Event::Vblank(event) => match DisplayIndex::from_index(event.user_data) {
                    Some(display) => vblanks.push(VblankEvent {
                        display,
                        sequence: event.frame,
                        time: event.time,
                    }),
                    None => trace!(user_data = event.user_data, "Got a vblank event for an unknown display"),
                },
                _ => trace!("Got a non-vblank event of device '{:?}'.", self.dev_path()),
            }
        }
        Ok(vblanks)
    }
}
