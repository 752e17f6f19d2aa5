//! Continuous preview broadcasting.
//!
//! One background thread per camera pushes the latest frame to every
//! subscriber at a capped rate. Frames captured for vision are offered to
//! the broadcaster so the preview reuses them instead of capturing again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use frame_settle_common::Frame;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::VisionError;
use crate::motion::MachineState;

/// Receives preview frames. Called on the broadcaster thread.
pub trait FrameListener: Send + Sync {
    fn frame_received(&self, frame: Arc<Frame>);
}

impl<F> FrameListener for F
where
    F: Fn(Arc<Frame>) + Send + Sync,
{
    fn frame_received(&self, frame: Arc<Frame>) {
        self(frame)
    }
}

/// Where the broadcaster gets frames when none was offered.
pub trait PreviewSource: Send + Sync {
    /// Capture and transform one frame.
    fn capture_preview(&self) -> Result<Arc<Frame>, VisionError>;

    fn has_new_frame(&self) -> bool {
        true
    }
}

/// Handle returned by [`ContinuousBroadcaster::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sub({})", &self.0.to_string()[..8])
    }
}

struct Subscription {
    listener: Arc<dyn FrameListener>,
    fps: f64,
}

/// Lifecycle of the broadcaster thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct LoopState {
    phase: Phase,
    /// Set by `notify`, consumed by the loop so a wakeup is never lost.
    wake_pending: bool,
    /// Highest generation whose thread has left its loop.
    exited_generation: u64,
    handle: Option<JoinHandle<()>>,
}

struct Shared {
    name: String,
    source: Weak<dyn PreviewSource>,
    subscribers: RwLock<HashMap<SubscriptionId, Subscription>>,
    /// Latest transformed frame, taken and cleared by the loop.
    slot: Mutex<Option<Arc<Frame>>>,
    state: Mutex<LoopState>,
    wake: Condvar,
    /// The thread started for generation `g` runs while this equals `g`.
    generation: AtomicU64,
    view_stale: AtomicBool,
    suspend_in_tasks: AtomicBool,
    machine: RwLock<Option<Arc<dyn MachineState>>>,
    join_timeout: Duration,
}

impl Shared {
    fn take(&self) -> Option<Arc<Frame>> {
        self.slot.lock().take()
    }

    fn is_suspended(&self) -> bool {
        if self.view_stale.load(Ordering::Acquire) {
            return false;
        }
        self.suspend_in_tasks.load(Ordering::Acquire)
            && self.machine.read().as_ref().is_some_and(|m| m.is_busy())
    }

    /// Highest subscriber rate, 0 when every subscriber is trigger-only.
    fn effective_fps(&self) -> f64 {
        self.subscribers
            .read()
            .values()
            .map(|s| s.fps)
            .filter(|fps| fps.is_finite() && *fps > 0.0)
            .fold(0.0, f64::max)
    }

    fn broadcast(&self, frame: Arc<Frame>) -> usize {
        let listeners: Vec<Arc<dyn FrameListener>> = self
            .subscribers
            .read()
            .values()
            .map(|s| s.listener.clone())
            .collect();
        for listener in &listeners {
            listener.frame_received(frame.clone());
        }
        listeners.len()
    }

    fn notify(&self) {
        let mut st = self.state.lock();
        st.wake_pending = true;
        self.wake.notify_all();
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    /// One loop iteration: broadcast the offered frame, else capture one.
    fn tick(&self) {
        let mut frame = self.take();
        if frame.is_none() && !self.is_suspended() {
            let Some(source) = self.source.upgrade() else {
                return;
            };
            if source.has_new_frame() {
                match source.capture_preview() {
                    Ok(captured) => frame = Some(captured),
                    Err(e) => warn!(camera = %self.name, "preview capture failed: {e}"),
                }
            }
        }
        if let Some(frame) = frame {
            let n = self.broadcast(frame);
            trace!(camera = %self.name, subscribers = n, "preview frame broadcast");
        }
    }

    fn run(self: Arc<Self>, generation: u64) {
        {
            let mut st = self.state.lock();
            if self.is_current(generation) && st.phase == Phase::Starting {
                st.phase = Phase::Running;
            }
        }
        debug!(camera = %self.name, generation, "preview thread started");

        while self.is_current(generation) {
            self.tick();

            let fps = self.effective_fps();
            let deadline = (fps > 0.0).then(|| Instant::now() + Duration::from_secs_f64(1.0 / fps));
            let mut st = self.state.lock();
            while !st.wake_pending && self.is_current(generation) {
                match deadline {
                    Some(deadline) => {
                        if self.wake.wait_until(&mut st, deadline).timed_out() {
                            break;
                        }
                    }
                    None => self.wake.wait(&mut st),
                }
            }
            st.wake_pending = false;
        }

        let mut st = self.state.lock();
        st.exited_generation = st.exited_generation.max(generation);
        self.wake.notify_all();
        debug!(camera = %self.name, generation, "preview thread exited");
    }
}

/// Pushes frames to subscribers from a background thread.
///
/// Phases: `Stopped -> Starting -> Running -> Stopping -> Stopped`. The
/// first subscriber starts the thread, the last unsubscribe stops it.
pub struct ContinuousBroadcaster {
    shared: Arc<Shared>,
}

impl ContinuousBroadcaster {
    pub fn new(name: impl Into<String>, source: Weak<dyn PreviewSource>, join_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                source,
                subscribers: RwLock::new(HashMap::new()),
                slot: Mutex::new(None),
                state: Mutex::new(LoopState {
                    phase: Phase::Stopped,
                    wake_pending: false,
                    exited_generation: 0,
                    handle: None,
                }),
                wake: Condvar::new(),
                generation: AtomicU64::new(0),
                view_stale: AtomicBool::new(false),
                suspend_in_tasks: AtomicBool::new(false),
                machine: RwLock::new(None),
                join_timeout,
            }),
        }
    }

    pub fn set_machine(&self, machine: Option<Arc<dyn MachineState>>) {
        *self.shared.machine.write() = machine;
    }

    pub fn set_suspend_in_tasks(&self, suspend: bool) {
        self.shared.suspend_in_tasks.store(suspend, Ordering::Release);
    }

    pub fn phase(&self) -> Phase {
        self.shared.state.lock().phase
    }

    pub fn is_running(&self) -> bool {
        matches!(self.phase(), Phase::Starting | Phase::Running)
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.read().len()
    }

    pub fn effective_fps(&self) -> f64 {
        self.shared.effective_fps()
    }

    /// Add a listener at `fps` frames per second, 0 for trigger-only.
    /// Starts the thread for the first subscriber.
    pub fn subscribe(&self, listener: Arc<dyn FrameListener>, fps: f64) -> SubscriptionId {
        let id = SubscriptionId::new();
        let first = {
            let mut subs = self.shared.subscribers.write();
            subs.insert(id, Subscription { listener, fps });
            subs.len() == 1
        };
        debug!(camera = %self.shared.name, %id, fps, "preview subscribed");
        if first {
            self.start();
        } else {
            // Pick up a possibly higher rate right away.
            self.notify();
        }
        id
    }

    /// Remove a listener. Stops the thread when none remain. Returns
    /// `false` for an unknown id.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let (removed, empty) = {
            let mut subs = self.shared.subscribers.write();
            let removed = subs.remove(&id).is_some();
            (removed, subs.is_empty())
        };
        if removed {
            debug!(camera = %self.shared.name, %id, "preview unsubscribed");
            if empty {
                self.stop();
            }
        }
        removed
    }

    /// Hand a freshly captured frame to the preview, replacing any frame
    /// not yet broadcast, and wake the loop.
    pub fn offer(&self, frame: Arc<Frame>) {
        *self.shared.slot.lock() = Some(frame);
        self.shared.notify();
    }

    /// Push a frame to every subscriber right now, on the caller's thread.
    pub fn broadcast(&self, frame: Arc<Frame>) -> usize {
        self.shared.broadcast(frame)
    }

    /// Wake the loop for one iteration.
    pub fn notify(&self) {
        self.shared.notify();
    }

    pub fn mark_view_stale(&self, stale: bool) {
        self.shared.view_stale.store(stale, Ordering::Release);
    }

    pub fn is_view_stale(&self) -> bool {
        self.shared.view_stale.load(Ordering::Acquire)
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.is_suspended()
    }

    /// Start the thread if it is not running.
    pub fn start(&self) {
        let mut st = self.shared.state.lock();
        if matches!(st.phase, Phase::Starting | Phase::Running) {
            return;
        }
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        st.phase = Phase::Starting;
        st.wake_pending = false;
        let shared = self.shared.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("preview-{}", self.shared.name))
            .spawn(move || shared.run(generation));
        match spawned {
            Ok(handle) => {
                st.handle = Some(handle);
                info!(camera = %self.shared.name, generation, "preview broadcaster started");
            }
            Err(e) => {
                st.phase = Phase::Stopped;
                warn!(camera = %self.shared.name, "failed to spawn preview thread: {e}");
            }
        }
    }

    /// Stop the thread, waiting at most the join timeout for it to exit.
    /// A thread that does not exit in time is detached; it leaves its loop
    /// at the next wakeup since its generation is no longer current.
    pub fn stop(&self) {
        let (generation, handle) = {
            let mut st = self.shared.state.lock();
            if matches!(st.phase, Phase::Stopped | Phase::Stopping) {
                return;
            }
            st.phase = Phase::Stopping;
            let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel);
            self.shared.wake.notify_all();
            (generation, st.handle.take())
        };

        let on_own_thread = handle
            .as_ref()
            .is_some_and(|h| h.thread().id() == std::thread::current().id());
        let deadline = Instant::now() + self.shared.join_timeout;
        let exited = {
            let mut st = self.shared.state.lock();
            if !on_own_thread {
                while st.exited_generation < generation {
                    if self.shared.wake.wait_until(&mut st, deadline).timed_out() {
                        break;
                    }
                }
            }
            if st.phase == Phase::Stopping {
                st.phase = Phase::Stopped;
            }
            st.exited_generation >= generation
        };

        match handle {
            Some(handle) if exited => {
                if handle.join().is_err() {
                    warn!(camera = %self.shared.name, "preview thread panicked");
                }
                info!(camera = %self.shared.name, generation, "preview broadcaster stopped");
            }
            Some(_) if on_own_thread => {
                debug!(camera = %self.shared.name, "preview stopped from its own thread");
            }
            Some(_) => warn!(
                camera = %self.shared.name,
                timeout_ms = self.shared.join_timeout.as_millis() as u64,
                "preview thread did not stop in time, detaching"
            ),
            None => {}
        }
    }
}

impl Drop for ContinuousBroadcaster {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::CaptureError;
    use frame_settle_common::PixelFormat;
    use std::sync::atomic::AtomicUsize;

    struct CountingSource {
        captures: AtomicUsize,
        fail: AtomicBool,
        live: AtomicBool,
    }

    impl CountingSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                captures: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                live: AtomicBool::new(true),
            })
        }
    }

    impl PreviewSource for CountingSource {
        fn capture_preview(&self) -> Result<Arc<Frame>, VisionError> {
            let n = self.captures.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(CaptureError::NoFrame {
                    device: "counting".into(),
                }
                .into());
            }
            Ok(Arc::new(
                Frame::filled(2, 2, PixelFormat::Gray8, 0).restamped(0, n as u64),
            ))
        }

        fn has_new_frame(&self) -> bool {
            self.live.load(Ordering::SeqCst)
        }
    }

    struct Busy(AtomicBool);

    impl MachineState for Busy {
        fn is_busy(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn broadcaster(source: &Arc<CountingSource>) -> ContinuousBroadcaster {
        let weak: Weak<CountingSource> = Arc::downgrade(source);
        let weak: Weak<dyn PreviewSource> = weak;
        ContinuousBroadcaster::new("test", weak, Duration::from_millis(500))
    }

    type Received = Arc<Mutex<Vec<Arc<Frame>>>>;

    fn collector() -> (Arc<dyn FrameListener>, Received) {
        let received: Received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let listener: Arc<dyn FrameListener> =
            Arc::new(move |frame: Arc<Frame>| sink.lock().push(frame));
        (listener, received)
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn every_subscriber_gets_the_same_frame() {
        let source = CountingSource::new();
        // only offered frames are broadcast
        source.live.store(false, Ordering::SeqCst);
        let b = broadcaster(&source);
        let collectors: Vec<_> = (0..3).map(|_| collector()).collect();
        let ids: Vec<_> = collectors
            .iter()
            .map(|(l, _)| b.subscribe(l.clone(), 0.0))
            .collect();

        let frame = Arc::new(Frame::filled(3, 3, PixelFormat::Gray8, 7));
        b.offer(frame.clone());
        assert!(wait_until(|| collectors.iter().all(|(_, r)| r.lock().len() == 1)));
        std::thread::sleep(Duration::from_millis(20));
        for (_, received) in &collectors {
            let received = received.lock();
            assert_eq!(received.len(), 1);
            assert!(Arc::ptr_eq(&received[0], &frame));
        }
        assert_eq!(source.captures.load(Ordering::SeqCst), 0);
        for id in ids {
            b.unsubscribe(id);
        }
    }

    #[test]
    fn first_subscriber_starts_last_stops() {
        let source = CountingSource::new();
        let b = broadcaster(&source);
        assert_eq!(b.phase(), Phase::Stopped);
        let (l1, _) = collector();
        let (l2, _) = collector();
        let a = b.subscribe(l1, 10.0);
        let c = b.subscribe(l2, 20.0);
        assert!(b.is_running());
        assert_eq!(b.effective_fps(), 20.0);
        assert!(b.unsubscribe(a));
        assert!(b.is_running());
        let started = Instant::now();
        assert!(b.unsubscribe(c));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(b.phase(), Phase::Stopped);
        assert!(!b.unsubscribe(c));
    }

    #[test]
    fn capture_errors_do_not_stop_the_loop() {
        let source = CountingSource::new();
        source.fail.store(true, Ordering::SeqCst);
        let b = broadcaster(&source);
        let (listener, received) = collector();
        let id = b.subscribe(listener, 200.0);
        assert!(wait_until(|| source.captures.load(Ordering::SeqCst) >= 3));
        assert!(received.lock().is_empty());
        source.fail.store(false, Ordering::SeqCst);
        assert!(wait_until(|| !received.lock().is_empty()));
        b.unsubscribe(id);
    }

    #[test]
    fn busy_machine_suspends_unless_view_is_stale() {
        let source = CountingSource::new();
        let b = broadcaster(&source);
        let machine = Arc::new(Busy(AtomicBool::new(true)));
        b.set_machine(Some(machine.clone()));
        b.set_suspend_in_tasks(true);
        assert!(b.is_suspended());
        b.mark_view_stale(true);
        assert!(!b.is_suspended());
        b.mark_view_stale(false);
        machine.0.store(false, Ordering::SeqCst);
        assert!(!b.is_suspended());
    }

    #[test]
    fn suspended_loop_still_forwards_offered_frames() {
        let source = CountingSource::new();
        let b = broadcaster(&source);
        b.set_machine(Some(Arc::new(Busy(AtomicBool::new(true)))));
        b.set_suspend_in_tasks(true);
        let (listener, received) = collector();
        let id = b.subscribe(listener, 100.0);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(source.captures.load(Ordering::SeqCst), 0);
        b.offer(Arc::new(Frame::filled(1, 1, PixelFormat::Gray8, 1)));
        assert!(wait_until(|| received.lock().len() == 1));
        b.unsubscribe(id);
    }

    #[test]
    fn restart_after_stop_uses_new_generation() {
        let source = CountingSource::new();
        let b = broadcaster(&source);
        let (listener, received) = collector();
        let id = b.subscribe(listener.clone(), 0.0);
        b.unsubscribe(id);
        let id = b.subscribe(listener, 0.0);
        assert!(b.is_running());
        assert!(wait_until(|| received.lock().len() >= 2));
        b.unsubscribe(id);
        assert_eq!(b.phase(), Phase::Stopped);
    }

    #[test]
    fn listeners_may_unsubscribe_from_the_callback() {
        let source = CountingSource::new();
        let b = Arc::new(broadcaster(&source));
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(AtomicUsize::new(0));
        let listener: Arc<dyn FrameListener> = {
            let b = Arc::downgrade(&b);
            let slot = slot.clone();
            let calls = calls.clone();
            Arc::new(move |_frame: Arc<Frame>| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let (Some(b), Some(id)) = (b.upgrade(), *slot.lock()) {
                    b.unsubscribe(id);
                }
            })
        };
        // a second, passive subscriber keeps the loop alive
        let (other, _) = collector();
        let keep = b.subscribe(other, 0.0);
        let id = b.subscribe(listener, 0.0);
        *slot.lock() = Some(id);
        b.offer(Arc::new(Frame::filled(1, 1, PixelFormat::Gray8, 1)));
        assert!(wait_until(|| b.subscriber_count() == 1));
        assert!(calls.load(Ordering::SeqCst) >= 1);
        b.unsubscribe(keep);
    }
}
