//! Vertical blank delivery
//!
//! A dedicated thread listens on the device file descriptor through a [`calloop`] event loop. Each
//! vertical blank advances the fence timeline of its display, is forwarded to the registered
//! [`VsyncObserver`] if vsync delivery is enabled for that display, and re-arms the request for the
//! next blank.
//!
//! The thread lives until [`VsyncNotifier::stop`] or until waiting for events fails. In the latter
//! case vsync delivery and timeline progress stop for good, which [`VsyncNotifier::is_running`]
//! reflects.

use std::fmt;
use std::io;
use std::os::unix::io::{AsFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use calloop::generic::Generic;
use calloop::{EventLoop, Interest, LoopSignal, Mode, PostAction};
use tracing::{debug, error, info, info_span, trace, warn};

use crate::device::{KmsDevice, VblankEvent};
use crate::display::{DisplayIndex, DisplayShared};
use crate::error::AccessError;

/// Receiver of vertical blank notifications
pub trait VsyncObserver: Send + Sync {
    /// A vertical blank happened on `display` at `timestamp` nanoseconds
    fn on_vsync(&self, display: DisplayIndex, timestamp: i64);
}

impl<F> VsyncObserver for F
where
    F: Fn(DisplayIndex, i64) + Send + Sync,
{
    fn on_vsync(&self, display: DisplayIndex, timestamp: i64) {
        self(display, timestamp)
    }
}

/// The slot the observer is registered in, shared with the vsync thread
#[derive(Clone, Default)]
pub struct ObserverSlot(Arc<RwLock<Option<Arc<dyn VsyncObserver>>>>);

impl fmt::Debug for ObserverSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverSlot")
            .field("registered", &self.0.read().unwrap().is_some())
            .finish()
    }
}

impl ObserverSlot {
    /// Replace the registered observer
    pub fn register(&self, observer: Arc<dyn VsyncObserver>) {
        *self.0.write().unwrap() = Some(observer);
    }

    fn get(&self) -> Option<Arc<dyn VsyncObserver>> {
        self.0.read().unwrap().clone()
    }
}

/// Turns vblank events into timeline progress and observer calls
#[derive(Debug)]
struct VblankDispatcher<D: KmsDevice> {
    device: Arc<D>,
    displays: Vec<Arc<DisplayShared>>,
    observer: ObserverSlot,
}

impl<D: KmsDevice> VblankDispatcher<D> {
    fn request_all(&self) {
        for display in &self.displays {
            display.arm(&*self.device);
        }
    }

    fn handle(&self, event: VblankEvent) {
        let Some(display) = self.displays.iter().find(|d| d.index() == event.display) else {
            trace!(display = ?event.display, "Vblank for a display without state");
            return;
        };

        let point = display.timeline().advance();
        trace!(display = ?event.display, sequence = event.sequence, point, "vblank");

        if display.vsync_enabled() {
            if let Some(observer) = self.observer.get() {
                observer.on_vsync(event.display, event.timestamp_ns());
            }
        }

        display.rearm(&*self.device);
    }

    /// Handle every pending event, returns the number of vblanks handled
    fn dispatch(&self) -> Result<usize, AccessError> {
        let events = self.device.receive_vblanks()?;
        let count = events.len();
        for event in events {
            self.handle(event);
        }
        Ok(count)
    }
}

#[derive(Debug)]
struct DeviceEvents<D: KmsDevice>(Arc<D>);

impl<D: KmsDevice> AsFd for DeviceEvents<D> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

struct LoopState<D: KmsDevice> {
    dispatcher: VblankDispatcher<D>,
    handled: usize,
    failed: bool,
}

fn raise_priority(nice: i32) {
    // SAFETY: no pointers involved, only changes the scheduling priority of the calling thread
    let ret = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) };
    if ret != 0 {
        warn!(
            nice,
            err = %io::Error::last_os_error(),
            "Unable to raise the priority of the vsync thread"
        );
    }
}

/// Handle to the vsync thread
#[derive(Debug)]
pub struct VsyncNotifier {
    stop: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    signal: LoopSignal,
    thread: Option<JoinHandle<()>>,
}

impl VsyncNotifier {
    /// Start the vsync thread
    ///
    /// One vblank request is issued per display before the thread starts waiting.
    pub fn spawn<D: KmsDevice>(
        device: Arc<D>,
        displays: Vec<Arc<DisplayShared>>,
        observer: ObserverSlot,
        wait_timeout: Duration,
        priority: i32,
    ) -> io::Result<VsyncNotifier> {
        let stop = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel();

        let thread_stop = stop.clone();
        let thread_running = running.clone();
        let thread = std::thread::Builder::new()
            .name("hwc-vsync".into())
            .spawn(move || {
                let span = info_span!("hwc_vsync");
                let _guard = span.enter();

                let dispatcher = VblankDispatcher {
                    device: device.clone(),
                    displays,
                    observer,
                };
                run(
                    device,
                    dispatcher,
                    tx,
                    &thread_stop,
                    wait_timeout,
                    priority,
                );
                thread_running.store(false, Ordering::Release);
            })?;

        match rx.recv() {
            Ok(Ok(signal)) => Ok(VsyncNotifier {
                stop,
                running,
                signal,
                thread: Some(thread),
            }),
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => {
                let _ = thread.join();
                Err(io::Error::new(io::ErrorKind::Other, "vsync thread exited during startup"))
            }
        }
    }

    /// Whether vblanks are still being delivered
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the thread and wait for it to exit
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.signal.wakeup();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("vsync thread panicked");
            }
        }
    }
}

impl Drop for VsyncNotifier {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<D: KmsDevice>(
    device: Arc<D>,
    dispatcher: VblankDispatcher<D>,
    startup: mpsc::Sender<io::Result<LoopSignal>>,
    stop: &AtomicBool,
    wait_timeout: Duration,
    priority: i32,
) {
    raise_priority(priority);

    let mut event_loop: EventLoop<'_, LoopState<D>> = match EventLoop::try_new() {
        Ok(event_loop) => event_loop,
        Err(err) => {
            let _ = startup.send(Err(err.into()));
            return;
        }
    };

    let source = Generic::new(DeviceEvents(device), Interest::READ, Mode::Level);
    let inserted = event_loop
        .handle()
        .insert_source(source, |_, _, state: &mut LoopState<D>| {
            match state.dispatcher.dispatch() {
                Ok(count) => {
                    state.handled += count;
                    Ok(PostAction::Continue)
                }
                Err(err) => {
                    error!(?err, "Failed to read vblank events");
                    state.failed = true;
                    Ok(PostAction::Remove)
                }
            }
        });
    if let Err(err) = inserted {
        let _ = startup.send(Err(err.error.into()));
        return;
    }
    let mut state = LoopState {
        dispatcher,
        handled: 0,
        failed: false,
    };
    // initial requests are settled before the composer can mode-set and re-arm a display
    state.dispatcher.request_all();
    if startup.send(Ok(event_loop.get_signal())).is_err() {
        return;
    }
    info!("vsync thread started");

    while !stop.load(Ordering::Acquire) {
        state.handled = 0;
        if let Err(err) = event_loop.dispatch(Some(wait_timeout), &mut state) {
            error!("Event handler error: {}", err);
            break;
        }
        if state.failed {
            break;
        }
        if state.handled == 0 && !stop.load(Ordering::Acquire) {
            info!("No vblank within {:?}", wait_timeout);
        } else {
            debug!(handled = state.handled, "dispatched vblanks");
        }
    }

    info!("vsync thread exiting");
}
