//! Two objects on two threads bounce a counter through queued connections.
//!
//! Run with `RUST_LOG=trellis_core=debug` to watch the dispatch.

use std::sync::LazyLock;

use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;
use trellis_core::{
    ConnectionType, EventLoop, EventLoopHandle, EventLoopThread, MetaObject, Object,
    ObjectSystem, ObjectTreeDebug, Signal, Slot, SlotContext,
};

const RALLY_LENGTH: i64 = 10;

const SERVE: Signal<(i64,)> = Signal::new("serve");
const RETURN_BALL: Slot<(i64,)> = Slot::new("return_ball");

struct Player {
    name: &'static str,
    referee: Mutex<Option<EventLoopHandle>>,
}

impl Player {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            referee: Mutex::new(None),
        }
    }
}

static PLAYER_META: LazyLock<MetaObject> = LazyLock::new(|| {
    MetaObject::builder("Player")
        .signal(&SERVE)
        .slot_with_context(&RETURN_BALL, |this: &Player, cx: &SlotContext<'_>, (count,)| {
            tracing::info!(
                player = this.name,
                thread = std::thread::current().name().unwrap_or("?"),
                count,
                "hit"
            );
            if count >= RALLY_LENGTH {
                if let Some(referee) = this.referee.lock().as_ref() {
                    referee.quit();
                }
                return;
            }
            cx.system().emit(cx.receiver(), &SERVE, (count + 1,));
        })
        .build()
});

impl Object for Player {
    fn meta_object(&self) -> &'static MetaObject {
        &PLAYER_META
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let system = ObjectSystem::new();
    let event_loop = EventLoop::new();
    let court = EventLoopThread::builder().name("court").spawn()?;

    let ping = system.create(Player::new("ping"), None);
    let pong = system.create(Player::new("pong"), None);
    system.set_object_name(ping, "ping");
    system.set_object_name(pong, "pong");
    system.move_to_thread(pong, Some(court.thread()))?;

    if let Some(player) = system.handler::<Player>(ping) {
        *player.referee.lock() = Some(event_loop.handle());
    }
    if let Some(player) = system.handler::<Player>(pong) {
        *player.referee.lock() = Some(event_loop.handle());
    }

    system.connect(ping, &SERVE, pong, &RETURN_BALL, ConnectionType::Auto)?;
    system.connect(pong, &SERVE, ping, &RETURN_BALL, ConnectionType::Auto)?;

    system.emit(ping, &SERVE, (1,));
    let code = event_loop.exec();

    print!("{}", ObjectTreeDebug::new(&system));
    court.stop();
    tracing::info!(code, "rally finished");
    Ok(())
}
