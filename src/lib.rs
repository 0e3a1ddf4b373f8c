#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
// Allow acronyms like DRM
#![allow(clippy::upper_case_acronyms)]

//! # hwcomposer-drm: a hardware composer on top of DRM/KMS
//!
//! This crate decides, once per frame, how the layers handed over by a window-compositing client are
//! presented on the available outputs. Layers that fit onto a free hardware overlay plane are scanned
//! out directly; everything underneath the first layer that does not fit is folded into the single
//! GPU-composited framebuffer target.
//!
//! ## Structure of the crate
//!
//! - [`device`] is the boundary to the kernel display subsystem. The [`device::KmsDevice`] trait is
//!   implemented by [`device::DrmDeviceFd`] using the [`drm`] crate.
//! - [`display`] tracks the outputs (connector, crtc, mode) and owns what is currently scanned out.
//! - [`planes`] assigns overlay planes to layers.
//! - [`sync`] owns the per-display fence timelines handing out release fences.
//! - [`vsync`] runs the background thread delivering vertical blanks.
//! - [`compositor`] ties everything together in the two-phase [`compositor::Composer`] protocol.
//!
//! ## The frame protocol
//!
//! Every frame the client first calls [`Composer::classify`](compositor::Composer::classify), which
//! marks each layer as [`Overlay`](layer::CompositionType::Overlay) or
//! [`Framebuffer`](layer::CompositionType::Framebuffer). The client renders all framebuffer layers into
//! the framebuffer target and then calls [`Composer::realize`](compositor::Composer::realize), which
//! programs the crtc and the overlay planes and fills in release and retire fences.
//!
//! ```rust,no_run
//! use hwcomposer_drm::{
//!     compositor::{Composer, HwComposer},
//!     config::ComposerConfig,
//!     display::DisplayIndex,
//!     layer::DisplayContents,
//! };
//!
//! let mut composer = HwComposer::open(ComposerConfig::from_env()).expect("no usable display");
//! composer.register_vsync_observer(std::sync::Arc::new(|display: DisplayIndex, timestamp: i64| {
//!     println!("vsync on {:?} at {}", display, timestamp);
//! }));
//!
//! let mut frame = vec![Some(DisplayContents::default()), None];
//! composer.classify(&mut frame).unwrap();
//! // ... render the framebuffer layers into the target ...
//! composer.realize(&mut frame).unwrap();
//! ```
//!
//! ### Logging
//!
//! This crate makes extensive use of [`tracing`] for its internal logging. Every display carries its
//! own span and the vsync thread runs inside the `hwc_vsync` span.

pub mod buffer;
pub mod compositor;
pub mod config;
pub mod device;
pub mod display;
pub mod error;
pub mod format;
pub mod layer;
pub mod planes;
pub mod sync;
pub mod utils;
pub mod vsync;

pub use drm;
pub use drm_fourcc;
