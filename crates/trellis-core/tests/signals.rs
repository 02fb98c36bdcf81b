//! Integration tests for signal/slot connections on a single thread.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use trellis_core::{
    ConnectionType, MetaObject, MethodKind, Object, ObjectError, ObjectId, ObjectSystem, Signal,
    SignalError, Slot, SlotContext, Value,
};

const READING: Signal<(i64, String)> = Signal::new("reading");
const RESET: Signal<()> = Signal::new("reset");

const SHOW: Slot<(i64,)> = Slot::new("show");
const SHOW_LABELLED: Slot<(i64, String)> = Slot::new("show_labelled");
const SHOW_TEXT: Slot<(String,)> = Slot::new("show_text");
const CLEAR: Slot<()> = Slot::new("clear");
const LOG: Slot<(i64, String)> = Slot::new("log");
const RELAYED: Signal<(i64,)> = Signal::new("relayed");

struct Sensor;

static SENSOR_META: LazyLock<MetaObject> = LazyLock::new(|| {
    MetaObject::builder("Sensor")
        .signal(&READING)
        .signal(&RESET)
        .build()
});

impl Object for Sensor {
    fn meta_object(&self) -> &'static MetaObject {
        &SENSOR_META
    }
}

#[derive(Default)]
struct Display {
    lines: Mutex<Vec<String>>,
    senders: Mutex<Vec<Option<ObjectId>>>,
}

impl Display {
    fn lines(system: &ObjectSystem, id: ObjectId) -> Vec<String> {
        system.handler::<Display>(id).unwrap().lines.lock().clone()
    }
}

static DISPLAY_META: LazyLock<MetaObject> = LazyLock::new(|| {
    MetaObject::builder("Display")
        .signal(&RELAYED)
        .slot_with_context(&SHOW, |this: &Display, cx: &SlotContext<'_>, (value,)| {
            this.lines.lock().push(format!("show {value}"));
            this.senders.lock().push(cx.sender());
        })
        .slot(&SHOW_LABELLED, |this: &Display, (value, label)| {
            this.lines.lock().push(format!("{label}={value}"));
        })
        .slot(&SHOW_TEXT, |this: &Display, (text,)| {
            this.lines.lock().push(text);
        })
        .slot(&CLEAR, |this: &Display, ()| {
            this.lines.lock().push("clear".into());
        })
        .slot_with_defaults(&LOG, 1, |this: &Display, (value, label)| {
            this.lines.lock().push(format!("log {label} {value}"));
        })
        .build()
});

impl Object for Display {
    fn meta_object(&self) -> &'static MetaObject {
        &DISPLAY_META
    }
}

fn setup() -> (ObjectSystem, ObjectId, ObjectId) {
    let system = ObjectSystem::new();
    let sensor = system.create(Sensor, None);
    let display = system.create(Display::default(), None);
    (system, sensor, display)
}

#[test]
fn direct_connection_runs_during_emit() {
    let (system, sensor, display) = setup();
    system
        .connect(sensor, &READING, display, &SHOW_LABELLED, ConnectionType::Direct)
        .unwrap();
    system.emit(sensor, &READING, (21, "temp".to_string()));
    assert_eq!(Display::lines(&system, display), vec!["temp=21"]);
}

#[test]
fn slot_may_take_fewer_arguments() {
    let (system, sensor, display) = setup();
    system.connect(sensor, &READING, display, &SHOW, ConnectionType::Auto).unwrap();
    system.connect(sensor, &READING, display, &CLEAR, ConnectionType::Auto).unwrap();
    system.emit(sensor, &READING, (5, "x".to_string()));

    assert_eq!(Display::lines(&system, display), vec!["show 5", "clear"]);
    let senders = system.handler::<Display>(display).unwrap().senders.lock().clone();
    assert_eq!(senders, vec![Some(sensor)]);
}

#[test]
fn incompatible_connections_are_rejected() {
    let (system, sensor, display) = setup();

    let err = system
        .connect(sensor, &RESET, display, &SHOW, ConnectionType::Auto)
        .unwrap_err();
    assert!(matches!(err, SignalError::IncompatibleArguments { .. }));

    let err = system
        .connect(sensor, &READING, display, &SHOW_TEXT, ConnectionType::Auto)
        .unwrap_err();
    assert!(matches!(err, SignalError::IncompatibleArguments { .. }));

    let err = system
        .connect_by_name(sensor, "nope", display, "show", ConnectionType::Auto)
        .unwrap_err();
    assert_eq!(
        err,
        SignalError::UnknownMethod {
            class: "Sensor",
            name: "nope".into()
        }
    );

    // The sender side must be a signal.
    let err = system
        .connect_by_name(display, "show", display, "show", ConnectionType::Auto)
        .unwrap_err();
    assert!(matches!(err, SignalError::NotASignal(_)));

    let gone = system.create_plain(None);
    system.destroy(gone);
    let err = system
        .connect(sensor, &READING, gone, &SHOW, ConnectionType::Auto)
        .unwrap_err();
    assert_eq!(err, SignalError::Object(ObjectError::InvalidObjectId(gone)));
    assert_eq!(system.connection_count(sensor), 0);
}

#[test]
fn foreign_methods_are_rejected() {
    let (system, sensor, display) = setup();
    let other = system.create(Sensor, None);
    let show = DISPLAY_META.method("show").unwrap();
    let reading = SENSOR_META.method("reading").unwrap();

    // `show` belongs to Display, not to Sensor.
    let err = system
        .connect_methods(sensor, reading, other, show, ConnectionType::Auto, false)
        .unwrap_err();
    assert!(matches!(err, SignalError::ForeignMethod { class: "Sensor", .. }));
    assert!(system
        .connect_methods(sensor, reading, display, show, ConnectionType::Auto, false)
        .is_ok());
}

#[test]
fn cloned_overloads_cannot_be_connected() {
    let (system, sensor, display) = setup();
    let cloned = DISPLAY_META
        .methods()
        .find(|m| m.name() == "log" && m.is_cloned())
        .unwrap();
    assert_eq!(cloned.parameters().len(), 1);
    let reading = SENSOR_META.method("reading").unwrap();

    let err = system
        .connect_methods(sensor, reading, display, cloned, ConnectionType::Auto, false)
        .unwrap_err();
    assert!(matches!(err, SignalError::ClonedSlot(_)));

    // The full overload is what name lookup finds.
    system.connect(sensor, &READING, display, &LOG, ConnectionType::Auto).unwrap();
    system.emit(sensor, &READING, (1, "a".to_string()));
    assert_eq!(Display::lines(&system, display), vec!["log a 1"]);
}

#[test]
fn duplicate_connections_fire_twice_unless_unique() {
    let (system, sensor, display) = setup();
    system.connect(sensor, &RESET, display, &CLEAR, ConnectionType::Direct).unwrap();
    system.connect(sensor, &RESET, display, &CLEAR, ConnectionType::Direct).unwrap();
    system.emit(sensor, &RESET, ());
    assert_eq!(Display::lines(&system, display).len(), 2);

    let err = system
        .connect_unique(sensor, &RESET, display, &CLEAR, ConnectionType::Direct)
        .unwrap_err();
    assert!(matches!(err, SignalError::DuplicateConnection { .. }));
    assert_eq!(system.receivers(sensor, &RESET), 2);
}

#[test]
fn unique_connect_is_idempotent() {
    let (system, sensor, display) = setup();
    system
        .connect_unique(sensor, &RESET, display, &CLEAR, ConnectionType::Auto)
        .unwrap();
    for _ in 0..3 {
        assert!(system
            .connect_unique(sensor, &RESET, display, &CLEAR, ConnectionType::Auto)
            .is_err());
    }
    system.emit(sensor, &RESET, ());
    assert_eq!(Display::lines(&system, display), vec!["clear"]);
}

#[test]
fn disconnect_with_wildcards() {
    let (system, sensor, display) = setup();
    let other = system.create(Display::default(), None);
    system.connect(sensor, &READING, display, &SHOW, ConnectionType::Auto).unwrap();
    system.connect(sensor, &RESET, display, &CLEAR, ConnectionType::Auto).unwrap();
    system.connect(sensor, &RESET, other, &CLEAR, ConnectionType::Auto).unwrap();

    let reset = SENSOR_META.method("reset");
    let clear = DISPLAY_META.method("clear");
    // A slot without a receiver is meaningless.
    assert!(!system.disconnect(sensor, reset, None, clear));

    assert!(system.disconnect(sensor, reset, Some(display), clear));
    assert!(!system.disconnect(sensor, reset, Some(display), clear));
    assert_eq!(system.receivers(sensor, &RESET), 1);

    assert!(system.disconnect(sensor, None, Some(display), None));
    assert!(!system.is_signal_connected(sensor, &READING));
    assert!(system.is_signal_connected(sensor, &RESET));

    assert!(system.disconnect_by_name(sensor, Some("reset"), Some(other), Some("clear")));
    assert!(!system.disconnect_by_name(sensor, Some("unknown"), None, None));
    assert_eq!(system.connection_count(sensor), 0);
}

#[test]
fn destroying_an_endpoint_removes_its_connections() {
    let (system, sensor, display) = setup();
    system.connect(sensor, &READING, display, &SHOW, ConnectionType::Auto).unwrap();
    system.connect(display, &RELAYED, display, &SHOW, ConnectionType::Auto).unwrap();
    assert_eq!(system.connection_count(display), 2);
    assert_eq!(system.connection_count(sensor), 1);

    system.destroy(display);
    assert_eq!(system.connection_count(sensor), 0);
    assert_eq!(system.receivers(sensor, &READING), 0);
    // Emitting to nobody is fine.
    system.emit(sensor, &READING, (1, String::new()));
}

#[test]
fn blocked_signals_are_dropped() {
    let (system, sensor, display) = setup();
    system.connect(sensor, &RESET, display, &CLEAR, ConnectionType::Auto).unwrap();

    assert_eq!(system.block_signals(sensor, true), Ok(false));
    assert!(system.signals_blocked(sensor));
    system.emit(sensor, &RESET, ());
    assert!(Display::lines(&system, display).is_empty());

    assert_eq!(system.block_signals(sensor, false), Ok(true));
    system.emit(sensor, &RESET, ());
    assert_eq!(Display::lines(&system, display), vec!["clear"]);
}

#[test]
fn destroyed_is_emitted_even_when_blocked() {
    let (system, sensor, display) = setup();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    system
        .connect_fn(sensor, &trellis_core::DESTROYED, display, ConnectionType::Auto, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    system.block_signals(sensor, true).unwrap();
    system.destroy(sensor);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn sender_destroyed_by_a_slot_stops_emission() {
    let (system, sensor, display) = setup();
    system
        .connect_fn(sensor, &RESET, display, ConnectionType::Direct, |cx, ()| {
            if let Some(sender) = cx.sender() {
                cx.system().destroy(sender);
            }
        })
        .unwrap();
    system.connect(sensor, &RESET, display, &CLEAR, ConnectionType::Direct).unwrap();

    system.emit(sensor, &RESET, ());
    assert!(!system.contains(sensor));
    assert!(Display::lines(&system, display).is_empty());
}

#[test]
fn slot_disconnecting_a_later_slot_prevents_it() {
    let (system, sensor, display) = setup();
    let later = Arc::new(Mutex::new(None));
    let target = later.clone();
    system
        .connect_fn(sensor, &RESET, display, ConnectionType::Direct, move |cx, ()| {
            if let Some(id) = *target.lock() {
                cx.system().disconnect_connection(id);
            }
        })
        .unwrap();
    let id = system.connect(sensor, &RESET, display, &CLEAR, ConnectionType::Direct).unwrap();
    *later.lock() = Some(id);

    system.emit(sensor, &RESET, ());
    assert!(Display::lines(&system, display).is_empty());
}

#[test]
fn signals_can_drive_signals() {
    let (system, sensor, display) = setup();
    let sink = system.create(Display::default(), None);
    system
        .connect_by_name(sensor, "reading", display, "relayed", ConnectionType::Auto)
        .unwrap();
    system.connect(display, &RELAYED, sink, &SHOW, ConnectionType::Auto).unwrap();

    system.emit(sensor, &READING, (9, "ignored".to_string()));
    assert_eq!(Display::lines(&system, sink), vec!["show 9"]);
    let senders = system.handler::<Display>(sink).unwrap().senders.lock().clone();
    assert_eq!(senders, vec![Some(display)]);
}

#[test]
fn queued_connection_waits_for_the_loop() {
    let (system, sensor, display) = setup();
    system.connect(sensor, &READING, display, &SHOW_LABELLED, ConnectionType::Queued).unwrap();
    system.connect(sensor, &READING, display, &SHOW, ConnectionType::Direct).unwrap();

    system.emit(sensor, &READING, (3, "q".to_string()));
    assert_eq!(Display::lines(&system, display), vec!["show 3"]);

    assert_eq!(system.send_posted_events(Some(display)), 1);
    assert_eq!(Display::lines(&system, display), vec!["show 3", "q=3"]);
}

#[test]
fn queued_calls_run_in_emission_order() {
    let (system, sensor, display) = setup();
    system.connect(sensor, &READING, display, &SHOW, ConnectionType::Queued).unwrap();
    for i in 0..5 {
        system.emit(sensor, &READING, (i, String::new()));
    }
    assert_eq!(system.send_posted_events(Some(display)), 5);
    assert_eq!(
        Display::lines(&system, display),
        vec!["show 0", "show 1", "show 2", "show 3", "show 4"]
    );
}

#[test]
fn queued_call_to_a_destroyed_receiver_is_dropped() {
    let (system, sensor, display) = setup();
    system.connect(sensor, &RESET, display, &CLEAR, ConnectionType::Queued).unwrap();
    system.emit(sensor, &RESET, ());
    let handler = system.handler::<Display>(display).unwrap();
    system.destroy(display);
    assert_eq!(system.send_posted_events(None), 0);
    assert!(handler.lines.lock().is_empty());
}

#[test]
fn guard_disconnects_on_drop() {
    let (system, sensor, display) = setup();
    let id = system.connect(sensor, &RESET, display, &CLEAR, ConnectionType::Auto).unwrap();
    {
        let guard = system.connection_guard(id);
        assert_eq!(guard.id(), id);
    }
    assert!(!system.is_signal_connected(sensor, &RESET));

    let id = system.connect(sensor, &RESET, display, &CLEAR, ConnectionType::Auto).unwrap();
    let released = system.connection_guard(id).release();
    assert_eq!(released, id);
    assert!(system.is_signal_connected(sensor, &RESET));
}

#[test]
fn dynamic_invocation() {
    let (system, sensor, display) = setup();
    let reading = SENSOR_META.method("reading").unwrap();
    let show = DISPLAY_META.method("show").unwrap();
    assert_eq!(reading.kind(), MethodKind::Signal);
    assert_eq!(reading.signature(), "Sensor::reading(Int, String)");

    system
        .connect_methods(sensor, reading, display, show, ConnectionType::Auto, true)
        .unwrap();
    system.emit_method(sensor, reading, vec![Value::from(4_i64), Value::from("s")]);
    assert!(system.invoke_method(display, show, &[Value::from(8_i64)]));
    assert_eq!(Display::lines(&system, display), vec!["show 4", "show 8"]);

    let senders = system.handler::<Display>(display).unwrap().senders.lock().clone();
    assert_eq!(senders, vec![Some(sensor), None]);
}

#[test]
fn delete_later_is_a_slot() {
    let (system, sensor, display) = setup();
    system
        .connect_by_name(sensor, "reset", display, "delete_later", ConnectionType::Auto)
        .unwrap();
    system.emit(sensor, &RESET, ());
    assert!(system.contains(display));
    system.send_posted_events(None);
    assert!(!system.contains(display));
}
