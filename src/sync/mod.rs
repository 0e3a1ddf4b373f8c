//! Release fences and their timelines
//!
//! Every display owns one [`FenceTimeline`]. The timeline moves forward exactly once per vertical
//! blank, driven by the vsync thread. Each realized frame gets a [`ReleaseFence`] bound to a point a
//! little ahead of the current value, so the buffers it scans out are handed back to the producer
//! only once a later blank has replaced them on screen.
//!
//! In-process the timeline is a plain atomic counter. If a kernel timeline is available (see
//! [`SwSyncTimeline`]) it is advanced in lockstep and every fence is additionally exported as a
//! native sync file descriptor, which is what other processes wait on.

use std::fmt;
use std::io;
use std::os::unix::io::{BorrowedFd, OwnedFd};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Condvar, Mutex,
};
use std::time::{Duration, Instant};

use rustix::event::{PollFd, PollFlags};
use tracing::{trace, warn};

use crate::layer::{CompositionType, DisplayContents};

mod sw_sync;

pub use self::sw_sync::SwSyncTimeline;

/// Default number of blanks between minting a fence and its timeline point
pub const FENCE_DELAY: u64 = 1;

/// A kernel synchronization timeline
pub trait SyncTimeline: fmt::Debug + Send + Sync {
    /// Move the timeline forward by `steps`, signaling every fence at or below the new value
    fn advance(&self, steps: u32) -> io::Result<()>;

    /// Create a native fence signaled once the timeline reaches `point`
    fn create_fence(&self, name: &str, point: u64) -> io::Result<OwnedFd>;
}

/// Waiting for a fence did not succeed
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    /// The fence was not signaled in time
    #[error("Timed out waiting for fence")]
    Timeout,
    /// Waiting itself failed
    #[error("Failed to wait for fence")]
    Os(#[source] io::Error),
}

struct TimelineInner {
    signaled: AtomicU64,
    lock: Mutex<()>,
    cond: Condvar,
    native: Option<Box<dyn SyncTimeline>>,
}

impl fmt::Debug for TimelineInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimelineInner")
            .field("signaled", &self.signaled.load(Ordering::Acquire))
            .field("native", &self.native)
            .finish_non_exhaustive()
    }
}

/// Per-display fence timeline
///
/// Cloning yields another handle to the same timeline. The counter has a single writer, the vsync
/// thread, and is read by the thread realizing frames.
#[derive(Debug, Clone)]
pub struct FenceTimeline(Arc<TimelineInner>);

impl FenceTimeline {
    /// Create a timeline, optionally mirrored by a kernel timeline
    pub fn new(native: Option<Box<dyn SyncTimeline>>) -> Self {
        FenceTimeline(Arc::new(TimelineInner {
            signaled: AtomicU64::new(0),
            lock: Mutex::new(()),
            cond: Condvar::new(),
            native,
        }))
    }

    /// Create a timeline without kernel counterpart
    ///
    /// Fences of such a timeline cannot be exported to other processes.
    pub fn software() -> Self {
        Self::new(None)
    }

    /// Whether fences of this timeline can be exported as sync files
    pub fn is_native(&self) -> bool {
        self.0.native.is_some()
    }

    /// Number of vertical blanks signaled so far
    pub fn signaled(&self) -> u64 {
        self.0.signaled.load(Ordering::Acquire)
    }

    /// Mint a fence for the point `delay` blanks ahead of the current value
    pub fn mint(&self, delay: u64) -> ReleaseFence {
        // the native timeline must not move between reading the value and creating the fence
        let _guard = self.0.lock.lock().unwrap();
        let point = self.signaled() + delay.max(1);
        let native = self.0.native.as_ref().and_then(|timeline| {
            match timeline.create_fence("hwc-release", point) {
                Ok(fd) => Some(Arc::new(fd)),
                Err(err) => {
                    warn!(?err, point, "Failed to create native release fence");
                    None
                }
            }
        });
        trace!(point, "Minted release fence");

        ReleaseFence {
            timeline: self.0.clone(),
            point,
            native,
        }
    }

    /// Move the timeline forward by one blank and release every fence that got reached
    ///
    /// Returns the new value.
    pub fn advance(&self) -> u64 {
        let value = {
            let _guard = self.0.lock.lock().unwrap();
            if let Some(native) = self.0.native.as_ref() {
                if let Err(err) = native.advance(1) {
                    warn!(?err, "Failed to advance native timeline");
                }
            }
            self.0.signaled.fetch_add(1, Ordering::AcqRel) + 1
        };
        self.0.cond.notify_all();
        value
    }

    /// Hand out the release fences of a realized frame
    ///
    /// Every layer that is scanned out gets a copy of one freshly minted fence, which is also the
    /// retire fence of the frame.
    pub fn bind_release_fences(&self, contents: &mut DisplayContents, delay: u64) -> ReleaseFence {
        let fence = self.mint(delay);
        for layer in contents.layers.iter_mut() {
            if matches!(
                layer.composition,
                CompositionType::Overlay | CompositionType::FramebufferTarget
            ) {
                layer.release_fence = Some(fence.clone());
            }
        }
        contents.retire_fence = Some(fence.clone());
        fence
    }
}

/// A point on a [`FenceTimeline`]
#[derive(Clone)]
#[must_use = "buffers must not be reused before their release fence is signaled"]
pub struct ReleaseFence {
    timeline: Arc<TimelineInner>,
    point: u64,
    native: Option<Arc<OwnedFd>>,
}

impl fmt::Debug for ReleaseFence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseFence")
            .field("point", &self.point)
            .field("signaled", &self.is_signaled())
            .field("native", &self.native.is_some())
            .finish()
    }
}

impl PartialEq for ReleaseFence {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.timeline, &other.timeline) && self.point == other.point
    }
}

impl ReleaseFence {
    /// Timeline value this fence waits for
    pub fn point(&self) -> u64 {
        self.point
    }

    /// Queries the state of the fence
    pub fn is_signaled(&self) -> bool {
        self.timeline.signaled.load(Ordering::Acquire) >= self.point
    }

    /// Blocks the current thread until the fence is signaled or `timeout` expired
    pub fn wait(&self, timeout: Option<Duration>) -> Result<(), WaitError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut guard = self.timeline.lock.lock().unwrap();
        while !self.is_signaled() {
            guard = match deadline {
                None => self.timeline.cond.wait(guard).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(WaitError::Timeout);
                    }
                    self.timeline.cond.wait_timeout(guard, deadline - now).unwrap().0
                }
            };
        }
        Ok(())
    }

    /// Returns whether this fence can be exported as a native fence fd
    pub fn is_exportable(&self) -> bool {
        self.native.is_some()
    }

    /// Export this fence as a new native fence fd
    pub fn export(&self) -> Option<OwnedFd> {
        self.native.as_ref().and_then(|fd| match fd.try_clone() {
            Ok(fd) => Some(fd),
            Err(err) => {
                warn!(?err, "Failed to duplicate release fence");
                None
            }
        })
    }
}

/// Wait for a sync file to signal, with a bounded timeout
pub fn wait_sync_file(fd: BorrowedFd<'_>, timeout: Duration) -> Result<(), WaitError> {
    let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    loop {
        let mut fds = [PollFd::new(&fd, PollFlags::IN)];
        match rustix::event::poll(&mut fds, timeout_ms) {
            Ok(0) => return Err(WaitError::Timeout),
            Ok(_) => {
                let revents = fds[0].revents();
                if revents.intersects(PollFlags::ERR | PollFlags::NVAL) {
                    return Err(WaitError::Os(io::Error::from_raw_os_error(libc::EINVAL)));
                }
                return Ok(());
            }
            Err(rustix::io::Errno::INTR) => continue,
            Err(err) => return Err(WaitError::Os(err.into())),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::layer::Layer;
    use std::os::unix::io::AsFd;
    use std::sync::atomic::AtomicU32;
    use std::thread;

    /// Kernel timeline stand-in handing out eventfds
    #[derive(Debug, Default)]
    pub(crate) struct CountingTimeline {
        pub advanced: AtomicU32,
        pub created: AtomicU32,
    }

    impl SyncTimeline for Arc<CountingTimeline> {
        fn advance(&self, steps: u32) -> io::Result<()> {
            self.advanced.fetch_add(steps, Ordering::SeqCst);
            Ok(())
        }

        fn create_fence(&self, _name: &str, _point: u64) -> io::Result<OwnedFd> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(rustix::event::eventfd(0, rustix::event::EventfdFlags::CLOEXEC)?)
        }
    }

    #[test]
    fn mint_wait_advance() {
        let timeline = FenceTimeline::software();
        let fence = timeline.mint(FENCE_DELAY);
        assert_eq!(fence.point(), 1);
        assert!(!fence.is_signaled());
        assert!(matches!(
            fence.wait(Some(Duration::from_millis(10))),
            Err(WaitError::Timeout)
        ));

        for _ in 0..FENCE_DELAY {
            timeline.advance();
        }
        assert!(fence.is_signaled());
        assert!(fence.wait(Some(Duration::from_millis(10))).is_ok());
    }

    #[test]
    fn no_early_release() {
        let timeline = FenceTimeline::software();
        timeline.advance();
        timeline.advance();
        let fence = timeline.mint(3);
        assert_eq!(fence.point(), 5);
        for blank in 3..5 {
            timeline.advance();
            assert!(!fence.is_signaled(), "fence signaled after {} blanks", blank);
        }
        timeline.advance();
        assert!(fence.is_signaled());
    }

    #[test]
    fn never_minted_for_passed_point() {
        let timeline = FenceTimeline::software();
        for _ in 0..4 {
            timeline.advance();
        }
        let fence = timeline.mint(0);
        assert!(fence.point() > timeline.signaled());
    }

    #[test]
    fn timeline_only_moves_forward() {
        let timeline = FenceTimeline::software();
        let mut last = timeline.signaled();
        for _ in 0..16 {
            let value = timeline.advance();
            assert_eq!(value, last + 1);
            last = value;
        }
    }

    #[test]
    fn wait_across_threads() {
        let timeline = FenceTimeline::software();
        let fence = timeline.mint(FENCE_DELAY);
        let waiter = thread::spawn(move || fence.wait(Some(Duration::from_secs(5))));
        thread::sleep(Duration::from_millis(20));
        timeline.advance();
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn native_timeline_in_lockstep() {
        let native = Arc::new(CountingTimeline::default());
        let timeline = FenceTimeline::new(Some(Box::new(native.clone())));
        assert!(timeline.is_native());

        let fence = timeline.mint(FENCE_DELAY);
        assert!(fence.is_exportable());
        assert!(fence.export().is_some());
        assert_eq!(native.created.load(Ordering::SeqCst), 1);

        timeline.advance();
        timeline.advance();
        assert_eq!(native.advanced.load(Ordering::SeqCst), 2);
    }

    /// Kernel timeline whose counter moves before the advance call returns
    #[derive(Debug, Default)]
    struct SlowTimeline {
        value: AtomicU64,
        minted: Mutex<Vec<(u64, u64)>>,
    }

    impl SyncTimeline for Arc<SlowTimeline> {
        fn advance(&self, steps: u32) -> io::Result<()> {
            self.value.fetch_add(steps as u64, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(300));
            Ok(())
        }

        fn create_fence(&self, _name: &str, point: u64) -> io::Result<OwnedFd> {
            let value = self.value.load(Ordering::SeqCst);
            self.minted.lock().unwrap().push((point, value));
            Ok(rustix::event::eventfd(0, rustix::event::EventfdFlags::CLOEXEC)?)
        }
    }

    #[test]
    fn mint_during_native_advance_stays_ahead() {
        let native = Arc::new(SlowTimeline::default());
        let timeline = FenceTimeline::new(Some(Box::new(native.clone())));

        let advancing = timeline.clone();
        let vsync = thread::spawn(move || advancing.advance());
        thread::sleep(Duration::from_millis(50));
        let fence = timeline.mint(FENCE_DELAY);
        assert_eq!(vsync.join().unwrap(), 1);

        let minted = native.minted.lock().unwrap().clone();
        assert_eq!(minted.len(), 1);
        let (point, native_value) = minted[0];
        assert_eq!(point, fence.point());
        assert!(point > native_value, "fence at {} but native timeline at {}", point, native_value);
        assert!(!fence.is_signaled());
    }

    #[test]
    fn software_fences_are_not_exportable() {
        let fence = FenceTimeline::software().mint(FENCE_DELAY);
        assert!(!fence.is_exportable());
        assert!(fence.export().is_none());
    }

    #[test]
    fn release_fences_equal_retire_fence() {
        let timeline = FenceTimeline::software();
        let mut overlay = Layer::default();
        overlay.composition = CompositionType::Overlay;
        let mut target = Layer::default();
        target.composition = CompositionType::FramebufferTarget;
        let composed = Layer::default();
        let mut contents = DisplayContents::new(vec![composed, overlay, target]);

        let fence = timeline.bind_release_fences(&mut contents, FENCE_DELAY);
        assert_eq!(contents.retire_fence.as_ref(), Some(&fence));
        assert!(contents.layers[0].release_fence.is_none());
        assert_eq!(contents.layers[1].release_fence.as_ref(), Some(&fence));
        assert_eq!(contents.layers[2].release_fence.as_ref(), Some(&fence));
    }

    #[test]
    fn signaled_sync_file() {
        let fd = rustix::event::eventfd(1, rustix::event::EventfdFlags::CLOEXEC).unwrap();
        assert!(wait_sync_file(fd.as_fd(), Duration::from_millis(100)).is_ok());
    }

    #[test]
    fn pending_sync_file_times_out() {
        let fd = rustix::event::eventfd(0, rustix::event::EventfdFlags::CLOEXEC).unwrap();
        assert!(matches!(
            wait_sync_file(fd.as_fd(), Duration::from_millis(10)),
            Err(WaitError::Timeout)
        ));
    }
}
