//! End-to-end scenarios across the supervisor, bus, services and schedulers.
//!
//! Every test boots its own supervisor with the environment layer disabled and
//! no signal hook, and registers channels under unique names.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use servisor::logging::LogRecord;
use servisor::{
    APP_ERROR, APP_OOM, APP_SHUTDOWN, BoxError, ChannelId, ConfigLoader, ConfigMap, Context, EXIT_OK,
    EXIT_OOM, Event, Job, LOG, RuntimeError, SERVICE_REGISTER, Service, ServiceRef, ServiceRequest,
    StopPredicate, Supervisor, TaskHandle, register_channel_id,
};
use tracing::Level;

const WAIT: Duration = Duration::from_secs(5);

fn boot_with(props: &[(&str, &str)], build: impl FnOnce(servisor::SupervisorBuilder) -> servisor::SupervisorBuilder) -> Supervisor {
    let mut loader = ConfigLoader::new().without_env();
    for (key, value) in props {
        loader = loader.property(key, *value);
    }
    let builder = Supervisor::builder()
        .config(loader)
        .handle_signals(false)
        .memory_probe(|| 0.0);
    build(builder).build().unwrap()
}

fn boot() -> Supervisor {
    boot_with(&[], |b| b)
}

/// Polls `cond` until it holds or `WAIT` elapses.
fn eventually(cond: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + WAIT;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Counts events on one channel; optionally claims them.
struct Echo {
    name: &'static str,
    channel: ChannelId,
    claim: bool,
    seen: AtomicUsize,
    starts: AtomicUsize,
    stops: AtomicUsize,
    changes: AtomicUsize,
}

impl Echo {
    fn new(name: &'static str, channel: ChannelId, claim: bool) -> Arc<Self> {
        Arc::new(Self {
            name,
            channel,
            claim,
            seen: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            changes: AtomicUsize::new(0),
        })
    }

    fn seen(&self) -> usize {
        self.seen.load(Ordering::SeqCst)
    }
}

impl Service for Echo {
    fn name(&self) -> &str {
        self.name
    }

    fn start(&self, _ctx: &Context) -> Result<(), BoxError> {
        thread::sleep(Duration::from_millis(30));
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self, _ctx: &Context) -> Result<(), BoxError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_event(&self, event: &Event) -> Result<(), BoxError> {
        if event.is(self.channel) {
            self.seen.fetch_add(1, Ordering::SeqCst);
            if self.claim {
                event.respond(format!("echo:{}", self.name));
            }
        }
        Ok(())
    }

    fn configure(&self, changes: &ConfigMap, _merged: &ConfigMap) {
        self.changes.fetch_add(changes.len(), Ordering::SeqCst);
    }
}

fn counter(sup: &Supervisor, channel: ChannelId, claim: bool) -> Arc<AtomicUsize> {
    let hits = Arc::new(AtomicUsize::new(0));
    let h = Arc::clone(&hits);
    sup.subscribe(channel, move |event| {
        h.fetch_add(1, Ordering::SeqCst);
        if claim {
            event.acknowledge();
        }
        Ok(())
    });
    hits
}

/// In-memory sink for a scoped `tracing` subscriber.
#[derive(Clone, Default)]
struct Capture(Arc<parking_lot::Mutex<Vec<u8>>>);

impl Capture {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl std::io::Write for Capture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn captured(capture: &Capture, f: impl FnOnce()) {
    let sink = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_max_level(Level::INFO)
        .with_writer(move || sink.clone())
        .finish();
    tracing::subscriber::with_default(subscriber, f);
}

// ============================================================================
// Dispatch
// ============================================================================

#[test]
fn targeted_event_stops_at_first_claim() {
    let ch = register_channel_id("it.claim.targeted");
    let echo = Echo::new("claim-echo", ch, true);
    let sup = boot_with(&[], |b| b.service(Arc::clone(&echo)));

    let first = counter(&sup, ch, false);
    let second = counter(&sup, ch, true);
    let third = counter(&sup, ch, false);

    let event = sup.context().send_event_return(ch, ()).unwrap();
    assert!(event.is_acknowledged());
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 1);
    assert_eq!(third.load(Ordering::SeqCst), 0);
    assert_eq!(echo.seen(), 0);

    sup.shutdown();
}

#[test]
fn broadcast_reaches_every_listener_and_service() {
    let ch = register_channel_id("it.claim.broadcast");
    let a = Echo::new("broadcast-a", ch, true);
    let b = Echo::new("broadcast-b", ch, true);
    let sup = boot_with(&[], |builder| builder.service(Arc::clone(&a)).service(Arc::clone(&b)));

    let first = counter(&sup, ch, true);
    let second = counter(&sup, ch, true);

    let event = sup.context().broadcast_event_return(ch, ()).unwrap();
    assert!(event.is_acknowledged());
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 1);
    assert_eq!(a.seen(), 1);
    assert_eq!(b.seen(), 1);

    sup.shutdown();
}

#[test]
fn events_are_dispatched_once() {
    let sup = boot();
    let ch = register_channel_id("it.redispatch");
    let ctx = sup.context();

    let event = ctx.new_event(ch).build();
    ctx.publish(&event).unwrap();
    assert!(matches!(
        ctx.publish(&event),
        Err(RuntimeError::AlreadyDispatched { .. })
    ));

    sup.shutdown();
}

#[test]
fn asynchronous_events_run_on_the_pool() {
    let sup = boot();
    let ch = register_channel_id("it.async");
    let (tx, rx) = mpsc::channel();
    let tx = parking_lot::Mutex::new(tx);
    sup.subscribe(ch, move |event| {
        let _ = tx.lock().send(*event.payload::<u32>().unwrap_or(&0));
        Ok(())
    });

    sup.context().send_event(ch, 7u32).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 7);

    sup.shutdown();
}

#[test]
fn targeted_then_broadcast() {
    let ch = register_channel_id("it.scenario.t");
    let echo = Echo::new("scenario-echo", ch, true);
    let sup = boot_with(&[], |b| b.service(Arc::clone(&echo)));

    let targeted = sup.context().send_event_return(ch, "ping".to_string()).unwrap();
    assert!(targeted.is_acknowledged());
    assert_eq!(targeted.response::<String>().as_deref().map(String::as_str), Some("echo:scenario-echo"));
    assert_eq!(echo.seen(), 1);

    let listener = counter(&sup, ch, false);
    let broadcast = sup.context().broadcast_event_return(ch, "ping".to_string()).unwrap();
    assert!(broadcast.is_acknowledged());
    assert_eq!(echo.seen(), 2);
    assert_eq!(listener.load(Ordering::SeqCst), 1);

    sup.shutdown();
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn unclaimed_log_records_reach_the_default_writer() {
    let sup = boot();
    let ctx = sup.context();

    let capture = Capture::default();
    captured(&capture, || {
        ctx.send_event_return(LOG, LogRecord::new(Level::WARN, "billing", "card declined"))
            .unwrap();
    });
    let text = capture.text();
    assert!(text.contains("card declined"), "{text}");
    assert!(text.contains("billing"), "{text}");

    let claimed = counter(&sup, LOG, true);
    let quiet = Capture::default();
    captured(&quiet, || {
        ctx.send_event_return(LOG, LogRecord::new(Level::WARN, "billing", "handled elsewhere"))
            .unwrap();
    });
    assert_eq!(claimed.load(Ordering::SeqCst), 1);
    assert!(!quiet.text().contains("handled elsewhere"));

    sup.shutdown();
}

#[test]
fn listener_failures_reach_the_error_channel() {
    let sup = boot();
    let ch = register_channel_id("it.failing");
    sup.subscribe(ch, |_| Err("listener broke".into()));

    let (tx, rx) = mpsc::channel();
    let tx = parking_lot::Mutex::new(tx);
    sup.subscribe(APP_ERROR, move |event| {
        let message = event.error().map(|e| e.to_string()).unwrap_or_default();
        let _ = tx.lock().send((event.original_channel(), message));
        event.acknowledge();
        Ok(())
    });

    sup.context().send_event_return(ch, ()).unwrap();
    let (origin, message) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(origin, ch);
    assert!(message.contains("listener broke"), "{message}");

    sup.shutdown();
}

#[test]
fn try_execute_contains_panics() {
    let sup = boot();
    let errors = counter(&sup, APP_ERROR, true);

    let value: Option<u8> = sup.context().try_execute(|| panic!("boom"));
    assert!(value.is_none());
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(sup.context().try_execute(|| Ok(5)), Some(5));

    sup.shutdown();
}

// ============================================================================
// Services
// ============================================================================

#[test]
fn concurrent_start_runs_start_once() {
    let sup = boot();
    let ch = register_channel_id("it.idempotent");
    let echo = Echo::new("idempotent", ch, false);

    let registered = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&registered);
    sup.subscribe(SERVICE_REGISTER, move |event| {
        if event.payload::<ServiceRef>().is_some_and(|s| s.name() == "idempotent") {
            r.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    });

    let first = sup.start_service(Arc::clone(&echo)).unwrap();
    let second = sup.start_service(Arc::clone(&echo)).unwrap();
    TaskHandle::wait_for(&[first, second], WAIT).unwrap();

    assert_eq!(echo.starts.load(Ordering::SeqCst), 1);
    assert_eq!(registered.load(Ordering::SeqCst), 1);
    assert_eq!(sup.services().len(), 1);
    assert!(sup.service::<Echo>().is_some());

    sup.shutdown();
}

#[test]
fn failed_start_offers_the_error_and_drops_the_service() {
    struct Broken {
        offered: AtomicUsize,
    }

    impl Service for Broken {
        fn start(&self, _ctx: &Context) -> Result<(), BoxError> {
            Err("no database".into())
        }

        fn stop(&self, _ctx: &Context) -> Result<(), BoxError> {
            Ok(())
        }

        fn on_failure(&self, error: &Event) -> Option<servisor::Value> {
            self.offered.fetch_add(1, Ordering::SeqCst);
            error.acknowledge();
            None
        }
    }

    let sup = boot();
    let errors = counter(&sup, APP_ERROR, false);
    let broken = Arc::new(Broken {
        offered: AtomicUsize::new(0),
    });

    sup.start_service(Arc::clone(&broken)).unwrap().wait();
    assert_eq!(broken.offered.load(Ordering::SeqCst), 1);
    assert_eq!(errors.load(Ordering::SeqCst), 0);
    assert!(sup.service::<Broken>().is_none());

    sup.shutdown();
}

#[test]
fn failed_start_racing_a_second_start_keeps_the_service_registered() {
    struct FlakyStart {
        attempts: AtomicUsize,
        stops: AtomicUsize,
    }

    impl Service for FlakyStart {
        fn start(&self, _ctx: &Context) -> Result<(), BoxError> {
            thread::sleep(Duration::from_millis(50));
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err("cold cache".into());
            }
            Ok(())
        }

        fn stop(&self, _ctx: &Context) -> Result<(), BoxError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_failure(&self, error: &Event) -> Option<servisor::Value> {
            error.acknowledge();
            None
        }
    }

    let sup = boot();
    let flaky = Arc::new(FlakyStart {
        attempts: AtomicUsize::new(0),
        stops: AtomicUsize::new(0),
    });

    let first = sup.start_service(Arc::clone(&flaky)).unwrap();
    let second = sup.start_service(Arc::clone(&flaky)).unwrap();
    TaskHandle::wait_for(&[first, second], WAIT).unwrap();

    assert_eq!(flaky.attempts.load(Ordering::SeqCst), 2);
    assert!(sup.service::<FlakyStart>().is_some());
    assert_eq!(sup.services().len(), 1);

    sup.shutdown();
    assert_eq!(flaky.stops.load(Ordering::SeqCst), 1);
}

#[test]
fn service_wait_polls_until_the_service_is_ready() {
    struct Slow;

    impl Service for Slow {
        fn start(&self, _ctx: &Context) -> Result<(), BoxError> {
            thread::sleep(Duration::from_millis(80));
            Ok(())
        }

        fn stop(&self, _ctx: &Context) -> Result<(), BoxError> {
            Ok(())
        }
    }

    let sup = boot();
    let ctx = sup.context();
    let _starting = sup.start_service(Arc::new(Slow)).unwrap();
    assert!(ctx.service_wait::<Slow>(WAIT).is_some());

    let begin = std::time::Instant::now();
    assert!(ctx.service_wait::<Echo>(Duration::from_millis(60)).is_none());
    assert!(begin.elapsed() >= Duration::from_millis(60));

    sup.shutdown();
}

#[test]
fn services_start_and_stop_through_events() {
    let sup = boot();
    let ch = register_channel_id("it.requests");
    let echo = Echo::new("requested", ch, false);
    let ctx = sup.context();

    let started = ctx
        .send_event_return(SERVICE_REGISTER, ServiceRequest::Start(ServiceRef::new(Arc::clone(&echo))))
        .unwrap();
    started.response::<TaskHandle>().unwrap().wait();
    assert!(sup.service::<Echo>().is_some());

    let stopped = ctx
        .send_event_return(servisor::SERVICE_UNREGISTER, ServiceRequest::Stop("requested".into()))
        .unwrap();
    assert_eq!(stopped.response::<bool>().as_deref(), Some(&true));
    assert!(sup.service::<Echo>().is_none());
    assert_eq!(echo.stops.load(Ordering::SeqCst), 1);

    assert!(!sup.stop_service("requested"));
    sup.shutdown();
}

#[test]
fn config_changes_reach_context_and_services() {
    let ch = register_channel_id("it.config");
    let echo = Echo::new("configured", ch, false);
    let sup = boot_with(&[], |b| b.service(Arc::clone(&echo)));

    let mut changes = ConfigMap::new();
    changes.insert("app_log_level".into(), "debug".into());
    changes.insert("feature_flag".into(), "on".into());
    sup.context()
        .broadcast_event_return(servisor::CONFIG_CHANGE, changes)
        .unwrap();

    assert_eq!(sup.context().get_string("feature_flag").as_deref(), Some("on"));
    assert_eq!(sup.config().log_level, tracing::level_filters::LevelFilter::DEBUG);
    assert_eq!(echo.changes.load(Ordering::SeqCst), 2);

    sup.shutdown();
}

// ============================================================================
// Tasks and schedulers
// ============================================================================

#[test]
fn run_await_joins_every_job() {
    let sup = boot();
    let hits = Arc::new(AtomicUsize::new(0));
    let jobs: Vec<Job> = (0..4)
        .map(|_| {
            let h = Arc::clone(&hits);
            Box::new(move |_: &Context| {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }) as Job
        })
        .collect();

    let handles = sup.context().run_await(jobs).unwrap();
    assert_eq!(handles.len(), 4);
    assert!(handles.iter().all(TaskHandle::is_done));
    assert_eq!(hits.load(Ordering::SeqCst), 4);

    sup.shutdown();
}

#[test]
fn one_shot_scheduler_is_swept_after_running() {
    let sup = boot();
    let (tx, rx) = mpsc::channel();
    let scheduler = sup
        .context()
        .run_after(Duration::from_millis(16), move |_| {
            let _ = tx.send(());
            Ok(())
        })
        .unwrap();
    assert!(sup.schedulers().iter().any(|s| s.id() == scheduler.id()));

    rx.recv_timeout(WAIT).unwrap();
    assert!(eventually(|| !sup.schedulers().iter().any(|s| s.id() == scheduler.id())));
    assert!(scheduler.is_terminated());
    assert_eq!(scheduler.runs(), 1);

    sup.shutdown();
}

#[test]
fn periodic_scheduler_honours_its_stop_predicate() {
    let sup = boot();
    let runs = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&runs);
    let seen = Arc::clone(&runs);
    let until: StopPredicate = Arc::new(move || seen.load(Ordering::SeqCst) >= 3);

    let scheduler = sup
        .context()
        .run_periodic(
            Duration::ZERO,
            Duration::from_millis(10),
            move |_| {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            Some(until),
        )
        .unwrap();

    assert!(eventually(|| scheduler.is_terminated()));
    assert_eq!(runs.load(Ordering::SeqCst), 3);

    sup.shutdown();
}

#[test]
fn failing_periodic_run_ends_the_scheduler() {
    let sup = boot();
    let errors = counter(&sup, APP_ERROR, true);
    let scheduler = sup
        .context()
        .run_periodic(Duration::ZERO, Duration::from_millis(10), |_| Err("tick failed".into()), None)
        .unwrap();

    assert!(eventually(|| scheduler.is_terminated()));
    assert!(eventually(|| errors.load(Ordering::SeqCst) == 1));

    sup.shutdown();
}

// ============================================================================
// Shutdown
// ============================================================================

#[test]
fn unreachable_initial_delay_parks_the_scheduler() {
    let sup = boot_with(&[("app_cleanup_ms", "16")], |b| b);
    let runs = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&runs);
    let parked = sup
        .context()
        .run_periodic(
            Duration::MAX,
            Duration::from_millis(10),
            move |_| {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            None,
        )
        .unwrap();

    thread::sleep(Duration::from_millis(150));
    assert!(!parked.is_terminated());
    assert!(sup.schedulers().iter().any(|s| Arc::ptr_eq(s, &parked)));
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    sup.shutdown();
    assert!(parked.is_terminated());
    assert_eq!(sup.scheduler_count(), 0);
}

#[test]
fn graceful_shutdown_releases_everything() {
    let ch = register_channel_id("it.shutdown");
    let echo = Echo::new("shutdown-echo", ch, false);
    let sup = boot_with(&[], |b| b.service(Arc::clone(&echo)));
    let observed = counter(&sup, APP_SHUTDOWN, false);
    sup.context()
        .run_periodic(Duration::from_secs(60), Duration::from_secs(60), |_| Ok(()), None)
        .unwrap();

    assert!(sup.is_ready());
    assert!(sup.scheduler_count() >= 3);
    assert_eq!(sup.services().len(), 1);

    sup.shutdown();

    assert!(!sup.is_ready());
    assert!(sup.services().is_empty());
    assert_eq!(sup.listener_count(), 0);
    assert_eq!(sup.scheduler_count(), 0);
    assert_eq!(observed.load(Ordering::SeqCst), 1);
    assert_eq!(echo.stops.load(Ordering::SeqCst), 1);
    assert_eq!(sup.exit_code(), Some(EXIT_OK));
    assert_eq!(sup.wait_for_stop(), EXIT_OK);

    // A second request is a no-op.
    sup.shutdown_with(3);
    assert_eq!(sup.exit_code(), Some(EXIT_OK));
}

#[test]
fn sequential_shutdown_stops_services_in_reverse_order() {
    struct Recorder {
        name: &'static str,
        log: Arc<parking_lot::Mutex<Vec<&'static str>>>,
    }

    impl Service for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn start(&self, _ctx: &Context) -> Result<(), BoxError> {
            Ok(())
        }

        fn stop(&self, _ctx: &Context) -> Result<(), BoxError> {
            self.log.lock().push(self.name);
            Ok(())
        }
    }

    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let make = |name| {
        Arc::new(Recorder {
            name,
            log: Arc::clone(&log),
        })
    };
    let sup = boot_with(&[], |b| b.service(make("first")).service(make("second")).service(make("third")));
    assert_eq!(sup.services().len(), 3);

    sup.shutdown();
    assert_eq!(*log.lock(), vec!["third", "second", "first"]);
}

#[test]
fn parallel_shutdown_stops_every_service() {
    let ch = register_channel_id("it.parallel");
    let a = Echo::new("parallel-a", ch, false);
    let b = Echo::new("parallel-b", ch, false);
    let sup = boot_with(&[("app_service_shutdown_parallel", "true")], |builder| {
        builder.service(Arc::clone(&a)).service(Arc::clone(&b))
    });
    assert_eq!(sup.services().len(), 2);

    sup.shutdown();
    assert_eq!(a.stops.load(Ordering::SeqCst), 1);
    assert_eq!(b.stops.load(Ordering::SeqCst), 1);
    assert!(sup.services().is_empty());
}

#[test]
fn unclaimed_oom_forces_shutdown() {
    let sup = boot_with(&[("app_cleanup_ms", "16")], |b| b.memory_probe(|| 99.5));
    assert_eq!(sup.wait_for_stop_timeout(WAIT), Some(EXIT_OOM));
    assert!(!sup.is_ready());
}

#[test]
fn claimed_oom_keeps_running() {
    let sup = boot_with(&[("app_cleanup_ms", "16")], |b| {
        b.memory_probe(|| 99.5).listener(APP_OOM, |event| {
            event.acknowledge();
            Ok(())
        })
    });
    assert_eq!(sup.wait_for_stop_timeout(Duration::from_millis(150)), None);
    assert!(sup.is_ready());

    sup.shutdown();
    assert_eq!(sup.exit_code(), Some(EXIT_OK));
}

#[test]
fn disabled_oom_threshold_never_fires() {
    let sup = boot_with(&[("app_cleanup_ms", "16"), ("app_oom_shutdown_threshold", "0")], |b| {
        b.memory_probe(|| 100.0)
    });
    assert_eq!(sup.wait_for_stop_timeout(Duration::from_millis(100)), None);
    sup.shutdown();
}
