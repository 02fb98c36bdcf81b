//! Integration tests for thread affinity, cross-thread dispatch and event
//! loop threads.

use std::sync::LazyLock;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use trellis_core::{
    ConnectionType, Event, EventContext, EventLoop, EventLoopThread, MetaObject, Object,
    ObjectError, ObjectSystem, Signal, Slot, ThreadHandle, TimerId,
};

const TIMEOUT: Duration = Duration::from_secs(5);

const REQUEST: Signal<(i64,)> = Signal::new("request");
const HANDLE: Slot<(i64,)> = Slot::new("handle");

/// Reports everything it receives, tagged with the name of the thread it ran
/// on.
struct Probe {
    tx: Sender<(String, String)>,
}

impl Probe {
    fn new() -> (Self, Receiver<(String, String)>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    fn report(&self, what: String) {
        let name = thread::current().name().unwrap_or("?").to_owned();
        let _ = self.tx.send((what, name));
    }
}

static PROBE_META: LazyLock<MetaObject> = LazyLock::new(|| {
    MetaObject::builder("Probe")
        .signal(&REQUEST)
        .slot(&HANDLE, |this: &Probe, (value,)| {
            this.report(format!("handle {value}"));
        })
        .build()
});

impl Object for Probe {
    fn meta_object(&self) -> &'static MetaObject {
        &PROBE_META
    }

    fn timer_event(&self, _cx: &EventContext<'_>, timer: TimerId) {
        self.report(format!("timer {}", timer.get()));
    }

    fn custom_event(&self, _cx: &EventContext<'_>, event: &mut Event) {
        if let Event::User(user) = event {
            self.report(format!("user {}", user.payload.as_str().unwrap_or("")));
        }
    }
}

fn spawn_worker(name: &str) -> EventLoopThread {
    EventLoopThread::builder().name(name).spawn().unwrap()
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

#[test]
fn objects_live_in_their_creating_thread() {
    let system = ObjectSystem::new();
    let here = system.create_plain(None);
    assert!(system.thread(here).unwrap().is_current());

    let remote = {
        let system = system.clone();
        thread::spawn(move || system.create_plain(None)).join().unwrap()
    };
    let remote_thread = system.thread(remote).unwrap();
    assert!(!remote_thread.is_current());
    assert_ne!(remote_thread, ThreadHandle::current());
}

#[test]
fn move_to_thread_rules() {
    let system = ObjectSystem::new();
    let worker = spawn_worker("rules");
    let parent = system.create_plain(None);
    let child = system.create_plain(Some(parent));

    assert_eq!(
        system.move_to_thread(child, Some(worker.thread())),
        Err(ObjectError::MoveParented(child))
    );

    system.move_to_thread(parent, Some(worker.thread())).unwrap();
    assert_eq!(system.thread(parent).unwrap(), *worker.thread());
    assert_eq!(system.thread(child).unwrap(), *worker.thread());

    // Only the object's own thread may push it elsewhere.
    assert_eq!(
        system.move_to_thread(parent, Some(&ThreadHandle::current())),
        Err(ObjectError::WrongThread(parent))
    );
    // Moving to the thread it already lives in is a no-op.
    assert_eq!(system.move_to_thread(parent, Some(worker.thread())), Ok(()));
}

#[test]
fn unbound_objects_can_be_pulled() {
    let system = ObjectSystem::new();
    let object = system.create_plain(None);
    system.move_to_thread(object, None).unwrap();
    assert!(!system.thread(object).unwrap().is_bound());

    let pulled = {
        let system = system.clone();
        thread::spawn(move || {
            system.move_to_thread(object, Some(&ThreadHandle::current()))?;
            Ok::<bool, ObjectError>(system.thread(object).unwrap().is_current())
        })
        .join()
        .unwrap()
    };
    assert_eq!(pulled, Ok(true));
}

#[test]
fn cross_thread_parenting_is_rejected() {
    let system = ObjectSystem::new();
    let worker = spawn_worker("parenting");
    let remote = system.create_plain(None);
    system.move_to_thread(remote, Some(worker.thread())).unwrap();
    let local = system.create_plain(None);

    assert_eq!(
        system.set_parent(local, Some(remote)),
        Err(ObjectError::ThreadMismatch { child: local, parent: remote })
    );
    assert_eq!(system.parent(local), None);
    assert!(system.children(remote).is_empty());

    // Creation under a foreign parent yields a parentless object.
    let orphan = system.create_plain(Some(remote));
    assert_eq!(system.parent(orphan), None);
    assert!(system.thread(orphan).unwrap().is_current());
}

#[test]
fn queued_events_follow_a_moved_object() {
    let system = ObjectSystem::new();
    let worker = spawn_worker("migrate");
    let (probe, rx) = Probe::new();
    let object = system.create(probe, None);

    for tag in ["1", "2", "3"] {
        system.post_event(object, Event::user(0, tag));
    }
    system.move_to_thread(object, Some(worker.thread())).unwrap();

    let received: Vec<(String, String)> = (0..3).map(|_| rx.recv_timeout(TIMEOUT).unwrap()).collect();
    assert_eq!(
        received,
        vec![
            ("user 1".to_string(), "migrate".to_string()),
            ("user 2".to_string(), "migrate".to_string()),
            ("user 3".to_string(), "migrate".to_string()),
        ]
    );
    // Nothing was left behind on this thread.
    assert_eq!(system.send_posted_events(None), 0);
}

#[test]
fn auto_connection_queues_across_threads() {
    let system = ObjectSystem::new();
    let worker = spawn_worker("auto");
    let sender = system.create(Probe::new().0, None);
    let (probe, rx) = Probe::new();
    let receiver = system.create(probe, None);

    system.connect(sender, &REQUEST, receiver, &HANDLE, ConnectionType::Auto).unwrap();

    // Same thread: direct.
    system.emit(sender, &REQUEST, (1,));
    let (what, thread_name) = rx.try_recv().unwrap();
    assert_eq!(what, "handle 1");
    assert_eq!(thread_name, thread::current().name().unwrap_or("?"));

    // Different thread: queued to the receiver's loop.
    system.move_to_thread(receiver, Some(worker.thread())).unwrap();
    system.emit(sender, &REQUEST, (2,));
    assert_eq!(
        rx.recv_timeout(TIMEOUT).unwrap(),
        ("handle 2".to_string(), "auto".to_string())
    );
}

#[test]
fn blocking_queued_waits_for_the_slot() {
    let system = ObjectSystem::new();
    let worker = spawn_worker("blocking");
    let sender = system.create(Probe::new().0, None);
    let (probe, rx) = Probe::new();
    let receiver = system.create(probe, None);
    system.move_to_thread(receiver, Some(worker.thread())).unwrap();

    system
        .connect(sender, &REQUEST, receiver, &HANDLE, ConnectionType::BlockingQueued)
        .unwrap();
    system.emit(sender, &REQUEST, (7,));

    // The slot has already run by the time emit returns.
    assert_eq!(
        rx.try_recv().unwrap(),
        ("handle 7".to_string(), "blocking".to_string())
    );
}

#[test]
fn blocking_call_is_released_when_the_loop_drops_it() {
    let system = ObjectSystem::new();
    let sender = system.create(Probe::new().0, None);
    let (probe, rx) = Probe::new();
    let receiver = system.create(probe, None);
    // No thread, so no loop will ever deliver the call.
    system.move_to_thread(receiver, None).unwrap();
    system
        .connect(sender, &REQUEST, receiver, &HANDLE, ConnectionType::BlockingQueued)
        .unwrap();

    let destroyer = {
        let system = system.clone();
        thread::spawn(move || {
            assert!(wait_until(|| system.thread(receiver).is_ok_and(|t| t.pending_events() > 0)));
            system.destroy(receiver);
        })
    };
    system.emit(sender, &REQUEST, (3,));
    destroyer.join().unwrap();

    assert!(!system.contains(receiver));
    assert!(rx.try_recv().is_err());
}

#[test]
fn deferred_delete_runs_on_the_owning_loop() {
    let system = ObjectSystem::new();
    let worker = spawn_worker("reaper");
    let object = system.create_plain(None);
    system.move_to_thread(object, Some(worker.thread())).unwrap();

    assert!(system.delete_later(object));
    assert!(wait_until(|| !system.contains(object)));
}

#[test]
fn timers_survive_a_thread_change() {
    let system = ObjectSystem::new();
    let worker = spawn_worker("timers");
    let (probe, rx) = Probe::new();
    let object = system.create(probe, None);

    let timer = {
        let _event_loop = EventLoop::new();
        let timer = system.start_timer(object, Duration::from_millis(5)).unwrap();
        system.move_to_thread(object, Some(worker.thread())).unwrap();
        timer
    };

    let expected = format!("timer {}", timer.get());
    let (what, thread_name) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(what, expected);
    assert_eq!(thread_name, "timers");
    assert!(worker.thread().timer_count() >= 1);
}

#[test]
fn timers_need_an_event_loop() {
    let system = ObjectSystem::new();
    let object = system.create_plain(None);
    assert!(!ThreadHandle::current().has_event_loop());
    assert!(system.start_timer(object, Duration::from_millis(1)).is_none());
}

#[test]
fn loop_thread_exit_code() {
    let worker = spawn_worker("exit");
    worker.handle().exit(3);
    assert_eq!(worker.join(), Some(3));
}
