//! Composer configuration
//!
//! [`ComposerConfig::default`] matches the behavior expected by the platform. Deployments may
//! override parts of it through the environment, see [`ComposerConfig::from_env`].

use std::time::Duration;

use tracing::{info, warn};

use crate::sync::FENCE_DELAY;

/// Kernel drivers tried, in order, when opening the display device
pub const DEFAULT_DRIVERS: &[&str] = &[
    "i915", "radeon", "nouveau", "vmwgfx", "omapdrm", "exynos", "tilcdc", "msm", "sti",
];

/// Nice value suitable for urgent display work
pub const URGENT_DISPLAY_PRIORITY: i32 = -8;

/// Settings of a [`HwComposer`](crate::compositor::HwComposer)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposerConfig {
    /// Candidate kernel driver names, the first one with a device node wins
    pub drivers: Vec<String>,
    /// Whether the external display may use overlay planes
    pub external_overlays: bool,
    /// Number of vertical blanks a release fence lies ahead of the current timeline point
    pub fence_delay: u64,
    /// Maximum time to wait for a layer's acquire fence
    pub acquire_timeout: Duration,
    /// Maximum time the vsync thread blocks without any event before logging that it is alive
    pub vsync_wait_timeout: Duration,
    /// Nice value of the vsync thread
    pub vsync_priority: i32,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        ComposerConfig {
            drivers: DEFAULT_DRIVERS.iter().map(|d| d.to_string()).collect(),
            external_overlays: false,
            fence_delay: FENCE_DELAY,
            acquire_timeout: Duration::from_secs(1),
            vsync_wait_timeout: Duration::from_secs(60),
            vsync_priority: URGENT_DISPLAY_PRIORITY,
        }
    }
}

fn parse_flag(value: &str) -> bool {
    let value = value.to_lowercase();
    value == "1" || value == "true" || value == "yes" || value == "y"
}

fn parse_drivers(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(String::from)
        .collect()
}

impl ComposerConfig {
    /// Default configuration with environment overrides applied
    ///
    /// - `HWC_DRM_DRIVER`: comma separated list replacing the candidate drivers
    /// - `HWC_EXTERNAL_OVERLAYS`: `1`, `true`, `yes` or `y` allow overlays on the external display
    /// - `HWC_FENCE_DELAY`: release fence headroom in vertical blanks, at least 1
    pub fn from_env() -> Self {
        let mut config = ComposerConfig::default();

        if let Ok(drivers) = std::env::var("HWC_DRM_DRIVER") {
            let drivers = parse_drivers(&drivers);
            if drivers.is_empty() {
                warn!("HWC_DRM_DRIVER is empty, keeping the default drivers");
            } else {
                info!(?drivers, "HWC_DRM_DRIVER is set");
                config.drivers = drivers;
            }
        }

        config.external_overlays = std::env::var("HWC_EXTERNAL_OVERLAYS")
            .map(|x| parse_flag(&x))
            .unwrap_or(false);
        if config.external_overlays {
            info!("HWC_EXTERNAL_OVERLAYS is set. Allowing overlay planes on the external display.");
        }

        if let Ok(delay) = std::env::var("HWC_FENCE_DELAY") {
            match delay.parse::<u64>() {
                Ok(delay) if delay > 0 => config.fence_delay = delay,
                _ => warn!(value = %delay, "Ignoring invalid HWC_FENCE_DELAY"),
            }
        }

        config
    }
}
