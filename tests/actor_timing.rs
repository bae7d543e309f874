//! Cross-component scenarios for the actor runtime: direct messages
//! racing scheduled timeouts, and serialization under a wide pool.

use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

use framewire::runtime::actor::{Actor, ActorRuntime, ActorRuntimeConfig};

static INIT_TRACING: Once = Once::new();

fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        framewire::init_tracing();
    });
}

fn test_runtime(workers: usize) -> ActorRuntime {
    init_test_tracing();
    ActorRuntime::new(ActorRuntimeConfig {
        workers,
        name: "timing".to_owned(),
    })
}

/// What happened to the actor and when, relative to registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Message(u32),
    Timeout,
}

struct Recorder {
    started: Instant,
    events: Arc<Mutex<Vec<(Event, Duration)>>>,
}

impl Actor for Recorder {
    type Message = u32;

    fn treat(&mut self, msg: u32) {
        self.events
            .lock()
            .unwrap()
            .push((Event::Message(msg), self.started.elapsed()));
    }

    fn timeout(&mut self) {
        self.events
            .lock()
            .unwrap()
            .push((Event::Timeout, self.started.elapsed()));
    }
}

#[test]
fn direct_message_beats_pending_timeout() {
    let runtime = test_runtime(2);
    let events = Arc::new(Mutex::new(Vec::new()));

    let handle = runtime.register(Recorder {
        started: Instant::now(),
        events: Arc::clone(&events),
    });
    handle.schedule_timeout(Duration::from_millis(50));

    thread::sleep(Duration::from_millis(10));
    handle.post(1);

    thread::sleep(Duration::from_millis(150));
    let events = events.lock().unwrap().clone();
    assert_eq!(events.len(), 2, "events: {events:?}");

    // The direct message ran first, well before the timeout fired...
    assert_eq!(events[0].0, Event::Message(1));
    assert!(events[0].1 < Duration::from_millis(50), "events: {events:?}");

    // ...and the timeout still fired at roughly its requested deadline,
    // unaffected by the earlier message.
    assert_eq!(events[1].0, Event::Timeout);
    assert!(events[1].1 >= Duration::from_millis(50), "events: {events:?}");
    assert!(events[1].1 < Duration::from_millis(130), "events: {events:?}");

    runtime.shutdown();
}

#[test]
fn timeouts_across_actors_fire_in_deadline_order() {
    let runtime = test_runtime(2);
    let order = Arc::new(Mutex::new(Vec::new()));

    struct Tagged {
        tag: u32,
        order: Arc<Mutex<Vec<u32>>>,
    }
    impl Actor for Tagged {
        type Message = ();
        fn treat(&mut self, (): ()) {}
        fn timeout(&mut self) {
            self.order.lock().unwrap().push(self.tag);
        }
    }

    // Register in one order, schedule in another.
    for (tag, delay_ms) in [(3, 90), (1, 30), (2, 60)] {
        let handle = runtime.register(Tagged {
            tag,
            order: Arc::clone(&order),
        });
        handle.schedule_timeout(Duration::from_millis(delay_ms));
    }

    thread::sleep(Duration::from_millis(200));
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    runtime.shutdown();
}

#[test]
fn kill_during_message_storm_is_final() {
    let runtime = test_runtime(4);
    let handled = Arc::new(Mutex::new(0u32));

    struct Sink(Arc<Mutex<u32>>);
    impl Actor for Sink {
        type Message = ();
        fn treat(&mut self, (): ()) {
            *self.0.lock().unwrap() += 1;
        }
    }

    let handle = runtime.register(Sink(Arc::clone(&handled)));
    for _ in 0..100 {
        handle.post(());
    }
    handle.kill();
    thread::sleep(Duration::from_millis(100));
    let settled = *handled.lock().unwrap();
    assert!(settled <= 100);
    assert!(!runtime.is_alive(handle.id()));

    // Nothing posted after the kill settles ever runs.
    for _ in 0..10 {
        handle.post(());
    }
    handle.schedule_timeout(Duration::from_millis(10));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(*handled.lock().unwrap(), settled);

    runtime.shutdown();
}
