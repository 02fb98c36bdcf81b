//! Per-thread event loops.
//!
//! An [`EventLoop`] drives the posted-event queue and the timers of the thread
//! it was created on. Creating one enables timers for that thread; dropping
//! the last one disables them again.
//!
//! [`EventLoopThread`] spawns a dedicated thread running a loop, which is the
//! usual target of [`ObjectSystem::move_to_thread`](crate::ObjectSystem::move_to_thread).
//!
//! # Example
//!
//! ```
//! use trellis_core::{EventLoopThread, ObjectSystem};
//!
//! let system = ObjectSystem::new();
//! let worker = EventLoopThread::builder().name("io").spawn().unwrap();
//!
//! let object = system.create_plain(None);
//! system.move_to_thread(object, Some(worker.thread())).unwrap();
//! assert_eq!(system.thread(object).unwrap(), *worker.thread());
//!
//! assert_eq!(worker.stop(), Some(0));
//! ```

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;

use crate::error::{CoreError, Result};
use crate::event::Event;
use crate::queue;
use crate::thread::ThreadHandle;

/// Default name of loop threads.
const DEFAULT_THREAD_NAME: &str = "trellis-loop";

struct LoopState {
    quit: AtomicBool,
    exit_code: AtomicI32,
}

/// An event loop bound to the thread that created it.
pub struct EventLoop {
    thread: ThreadHandle,
    state: Arc<LoopState>,
    // Bound to its thread.
    _not_send: PhantomData<*const ()>,
}

impl EventLoop {
    /// Install a loop on the calling thread.
    pub fn new() -> Self {
        let thread = ThreadHandle::current();
        thread.enter_loop();
        Self {
            thread,
            state: Arc::new(LoopState {
                quit: AtomicBool::new(false),
                exit_code: AtomicI32::new(0),
            }),
            _not_send: PhantomData,
        }
    }

    /// The thread the loop runs on.
    pub fn thread(&self) -> &ThreadHandle {
        &self.thread
    }

    /// A handle that can stop the loop from any thread.
    pub fn handle(&self) -> EventLoopHandle {
        EventLoopHandle {
            thread: self.thread.clone(),
            state: self.state.clone(),
        }
    }

    /// Fire due timers, then deliver the posted events queued so far.
    ///
    /// Never blocks. Returns the number of events delivered.
    #[tracing::instrument(skip(self), target = "trellis_core::event", level = "trace")]
    pub fn process_events(&self) -> usize {
        let mut delivered = 0;
        for due in self.thread.take_due_timers(Instant::now()) {
            // An earlier timer handler may have killed this one.
            if !self.thread.is_timer_registered(due.id) {
                continue;
            }
            if let Some(system) = due.system.upgrade() {
                system.send_event(due.object, &mut Event::Timer(due.id));
                delivered += 1;
            }
        }
        delivered + queue::send_posted_events(&self.thread, None)
    }

    /// Wait at most `max_wait` for an event or a timer, then process events.
    pub fn process_events_timeout(&self, max_wait: Duration) -> usize {
        let now = Instant::now();
        let timeout = self
            .thread
            .time_until_next_timer(now)
            .map_or(max_wait, |next| next.min(max_wait));
        let quit = &self.state.quit;
        self.thread
            .wait(Some(timeout), |queue| queue.pending() > 0 || quit.load(Ordering::Acquire));
        self.process_events()
    }

    /// Run until [`quit`](Self::quit) or [`exit`](Self::exit) is called.
    ///
    /// Returns the exit code.
    pub fn exec(&self) -> i32 {
        self.state.quit.store(false, Ordering::Release);
        tracing::debug!(target: "trellis_core::event", thread = self.thread.id(), "event loop started");
        loop {
            self.process_events();
            if self.state.quit.load(Ordering::Acquire) {
                break;
            }
            let timeout = self.thread.time_until_next_timer(Instant::now());
            let quit = &self.state.quit;
            self.thread
                .wait(timeout, |queue| queue.pending() > 0 || quit.load(Ordering::Acquire));
        }
        let code = self.state.exit_code.load(Ordering::Acquire);
        tracing::debug!(target: "trellis_core::event", thread = self.thread.id(), code, "event loop finished");
        code
    }

    /// Stop [`exec`](Self::exec) with exit code 0.
    pub fn quit(&self) {
        self.exit(0);
    }

    /// Stop [`exec`](Self::exec) with `code`.
    pub fn exit(&self, code: i32) {
        self.handle().exit(code);
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.thread.exit_loop();
    }
}

/// Stops an [`EventLoop`] from any thread.
#[derive(Clone)]
pub struct EventLoopHandle {
    thread: ThreadHandle,
    state: Arc<LoopState>,
}

impl EventLoopHandle {
    /// Stop the loop with exit code 0.
    pub fn quit(&self) {
        self.exit(0);
    }

    /// Stop the loop with `code`.
    pub fn exit(&self, code: i32) {
        self.state.exit_code.store(code, Ordering::Release);
        self.state.quit.store(true, Ordering::Release);
        self.thread.wake();
    }

    /// The thread the loop runs on.
    pub fn thread(&self) -> &ThreadHandle {
        &self.thread
    }
}

/// Configuration of an [`EventLoopThread`].
#[derive(Debug, Clone)]
pub struct EventLoopConfig {
    /// Name for the thread.
    pub name: String,
    /// Stack size in bytes. `None` uses the platform default.
    pub stack_size: Option<usize>,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_THREAD_NAME.to_string(),
            stack_size: None,
        }
    }
}

impl EventLoopConfig {
    /// Default configuration with the given thread name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Builder for [`EventLoopThread`].
#[derive(Debug, Default)]
pub struct EventLoopThreadBuilder {
    config: EventLoopConfig,
}

impl EventLoopThreadBuilder {
    /// Builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the thread name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the thread's stack size.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = Some(size);
        self
    }

    /// Start the thread and wait until its loop runs.
    pub fn spawn(self) -> Result<EventLoopThread> {
        EventLoopThread::with_config(self.config)
    }
}

/// A thread running an [`EventLoop`] until stopped.
///
/// Dropping it stops the loop and joins the thread.
pub struct EventLoopThread {
    name: String,
    thread: ThreadHandle,
    handle: EventLoopHandle,
    join: Option<JoinHandle<i32>>,
}

impl EventLoopThread {
    /// Builder for a loop thread.
    pub fn builder() -> EventLoopThreadBuilder {
        EventLoopThreadBuilder::new()
    }

    /// Spawn a loop thread with default configuration.
    pub fn spawn() -> Result<Self> {
        Self::with_config(EventLoopConfig::default())
    }

    /// Spawn a loop thread.
    pub fn with_config(config: EventLoopConfig) -> Result<Self> {
        let (ready_tx, ready_rx) = bounded(1);

        let mut builder = thread::Builder::new().name(config.name.clone());
        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let join = builder.spawn(move || {
            let event_loop = EventLoop::new();
            if ready_tx
                .send((event_loop.thread().clone(), event_loop.handle()))
                .is_err()
            {
                return 0;
            }
            drop(ready_tx);
            event_loop.exec()
        })?;

        let (thread, handle) = ready_rx
            .recv()
            .map_err(|_| CoreError::LoopStartup(config.name.clone()))?;
        tracing::debug!(target: "trellis_core::thread", name = %config.name, id = thread.id(), "event loop thread started");

        Ok(Self {
            name: config.name,
            thread,
            handle,
            join: Some(join),
        })
    }

    /// The thread's affinity record, the target for moving objects there.
    pub fn thread(&self) -> &ThreadHandle {
        &self.thread
    }

    /// A handle stopping the loop.
    pub fn handle(&self) -> &EventLoopHandle {
        &self.handle
    }

    /// The thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the loop to stop without waiting.
    pub fn quit(&self) {
        self.handle.quit();
    }

    /// Stop the loop and wait for the thread.
    ///
    /// Returns the loop's exit code, or `None` if the thread panicked.
    pub fn stop(mut self) -> Option<i32> {
        self.handle.quit();
        self.join_inner()
    }

    /// Wait for the loop to be stopped by someone else.
    pub fn join(mut self) -> Option<i32> {
        self.join_inner()
    }

    fn join_inner(&mut self) -> Option<i32> {
        let join = self.join.take()?;
        match join.join() {
            Ok(code) => Some(code),
            Err(_) => {
                tracing::error!(target: "trellis_core::thread", name = %self.name, "event loop thread panicked");
                None
            }
        }
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.handle.quit();
            let _ = self.join_inner();
        }
    }
}
