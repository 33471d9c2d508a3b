use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use solo_bridge::event_bus::EventBus;
use solo_bridge::protocol::EventKind;
use solo_core::config::DaemonSettings;
use solo_core::store::AgentStateStore;
use solo_core::types::{DaemonStatus, ProcessIdentity};
use solo_daemon::services::{Service, ServiceGate, StaticSettings};
use solo_daemon::{DaemonController, HeartbeatManager};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

type CallLog = Arc<Mutex<Vec<String>>>;

struct TestService {
    name: String,
    fail_start: bool,
    log: CallLog,
}

impl TestService {
    fn ok(name: &str, log: CallLog) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail_start: false,
            log,
        })
    }

    fn failing(name: &str, log: CallLog) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail_start: true,
            log,
        })
    }
}

#[async_trait]
impl Service for TestService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> anyhow::Result<()> {
        if self.fail_start {
            anyhow::bail!("{} refused to start", self.name);
        }
        self.log
            .lock()
            .expect("log lock")
            .push(format!("start:{}", self.name));
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.log
            .lock()
            .expect("log lock")
            .push(format!("stop:{}", self.name));
        Ok(())
    }
}

async fn controller_with(
    settings: DaemonSettings,
    pid: &str,
) -> (Arc<DaemonController>, Arc<AgentStateStore>, EventBus) {
    let store = Arc::new(AgentStateStore::new_in_memory().await.expect("store"));
    build_controller(store, settings, pid)
}

fn build_controller(
    store: Arc<AgentStateStore>,
    settings: DaemonSettings,
    pid: &str,
) -> (Arc<DaemonController>, Arc<AgentStateStore>, EventBus) {
    let identity = ProcessIdentity::new(pid, "test-host");
    let bus = EventBus::new();
    let heartbeat = Arc::new(HeartbeatManager::new(
        store.clone(),
        identity.clone(),
        bus.clone(),
    ));
    let controller = Arc::new(DaemonController::new(
        "main",
        store.clone(),
        heartbeat,
        bus.clone(),
        Arc::new(StaticSettings::new(settings)),
        identity,
    ));
    (controller, store, bus)
}

fn settings() -> DaemonSettings {
    DaemonSettings {
        heartbeat_interval_ms: 60_000,
        stale_threshold_ms: 180_000,
        boot_scripts_enabled: false,
        ..DaemonSettings::default()
    }
}

fn event_kinds(bus: &EventBus) -> Vec<EventKind> {
    bus.recent_activity(64).iter().map(|e| e.kind).collect()
}

// ---------------------------------------------------------------------------
// start
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_reaches_running_and_stamps_the_row() {
    let (controller, store, bus) = controller_with(settings(), "100").await;

    assert!(controller.start().await);
    assert_eq!(controller.status(), DaemonStatus::Running);

    let state = store.get("main").await.expect("get").expect("row");
    assert_eq!(state.status, DaemonStatus::Running);
    assert_eq!(state.process_id.as_deref(), Some("100"));
    assert!(state.started_at.is_some());
    assert!(state.last_heartbeat_at.is_some());

    let kinds = event_kinds(&bus);
    assert!(kinds.contains(&EventKind::Starting));
    assert!(kinds.contains(&EventKind::Started));

    controller.stop().await;
}

#[tokio::test]
async fn start_is_a_noop_while_already_running() {
    let (controller, _store, bus) = controller_with(settings(), "100").await;

    assert!(controller.start().await);
    let events_before = bus.recent_activity(64).len();
    // Second start returns true without a second startup sequence.
    assert!(controller.start().await);
    assert_eq!(bus.recent_activity(64).len(), events_before);

    controller.stop().await;
}

struct SlowService {
    log: CallLog,
}

#[async_trait]
impl Service for SlowService {
    fn name(&self) -> &str {
        "slow"
    }

    async fn start(&self) -> anyhow::Result<()> {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        self.log.lock().expect("log lock").push("start:slow".to_string());
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.log.lock().expect("log lock").push("stop:slow".to_string());
        Ok(())
    }
}

#[tokio::test]
async fn reentrant_start_is_rejected_mid_transition() {
    let (controller, _store, _bus) = controller_with(settings(), "100").await;
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    controller.register_service(Arc::new(SlowService { log: log.clone() }), ServiceGate::Always);

    let racing = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.start().await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // First start is still inside the service sequence.
    assert_eq!(controller.status(), DaemonStatus::Starting);
    assert!(!controller.start().await, "second start must be rejected");

    assert!(racing.await.expect("join"), "first start must win");
    assert_eq!(controller.status(), DaemonStatus::Running);
    // The service sequence ran exactly once.
    assert_eq!(*log.lock().expect("log lock"), vec!["start:slow"]);
    controller.stop().await;
}

#[tokio::test]
async fn disabled_config_makes_start_a_deliberate_noop() {
    let cfg = DaemonSettings {
        enabled: false,
        ..settings()
    };
    let (controller, store, bus) = controller_with(cfg, "100").await;

    assert!(!controller.start().await);
    assert_eq!(controller.status(), DaemonStatus::Stopped);
    assert!(event_kinds(&bus).contains(&EventKind::Disabled));
    // No leadership claim, no row creation.
    assert!(store.get("main").await.expect("get").is_none());
}

#[tokio::test]
async fn start_defers_to_a_healthy_foreign_owner() {
    let (owner, store, _bus) = controller_with(settings(), "100").await;
    assert!(owner.start().await);

    let (rival, _store, rival_bus) = build_controller(store.clone(), settings(), "200");
    assert!(!rival.start().await);
    assert_eq!(rival.status(), DaemonStatus::Stopped);
    assert!(event_kinds(&rival_bus).contains(&EventKind::LeadershipDenied));

    // The owner's row is untouched.
    let state = store.get("main").await.expect("get").expect("row");
    assert_eq!(state.process_id.as_deref(), Some("100"));

    owner.stop().await;
}

#[tokio::test]
async fn one_failing_service_does_not_sink_the_start() {
    let (controller, _store, bus) = controller_with(settings(), "100").await;
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));

    controller.register_service(TestService::ok("scheduler", log.clone()), ServiceGate::Always);
    controller.register_service(
        TestService::failing("connector", log.clone()),
        ServiceGate::Always,
    );
    controller.register_service(TestService::ok("triggers", log.clone()), ServiceGate::Always);

    assert!(controller.start().await);
    assert_eq!(controller.status(), DaemonStatus::Running);

    let kinds = event_kinds(&bus);
    assert!(kinds.contains(&EventKind::ServiceStartFailed));
    assert_eq!(
        *log.lock().expect("log lock"),
        vec!["start:scheduler", "start:triggers"]
    );

    // Shutdown only touches services that actually started.
    controller.stop().await;
    let calls = log.lock().expect("log lock").clone();
    assert_eq!(
        calls,
        vec![
            "start:scheduler",
            "start:triggers",
            "stop:triggers",
            "stop:scheduler"
        ]
    );
}

#[tokio::test]
async fn gated_services_stay_down() {
    let cfg = DaemonSettings {
        auto_start_on_boot: false,
        proactive_messaging_enabled: false,
        ..settings()
    };
    let (controller, _store, _bus) = controller_with(cfg, "100").await;
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));

    controller.register_service(TestService::ok("scheduler", log.clone()), ServiceGate::Always);
    controller.register_service(
        TestService::ok("connectors", log.clone()),
        ServiceGate::AutoStartOnBoot,
    );
    controller.register_service(
        TestService::ok("proactive", log.clone()),
        ServiceGate::ProactiveMessaging,
    );

    assert!(controller.start().await);
    assert_eq!(*log.lock().expect("log lock"), vec!["start:scheduler"]);
    controller.stop().await;
}

// ---------------------------------------------------------------------------
// stop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stop_reverses_the_recorded_start_order() {
    let (controller, store, _bus) = controller_with(settings(), "100").await;
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));

    for name in ["a", "b", "c"] {
        controller.register_service(TestService::ok(name, log.clone()), ServiceGate::Always);
    }

    assert!(controller.start().await);
    assert!(controller.stop().await);
    assert_eq!(controller.status(), DaemonStatus::Stopped);

    assert_eq!(
        *log.lock().expect("log lock"),
        vec!["start:a", "start:b", "start:c", "stop:c", "stop:b", "stop:a"]
    );

    let state = store.get("main").await.expect("get").expect("row");
    assert_eq!(state.status, DaemonStatus::Stopped);
    assert!(state.stopped_at.is_some());
}

#[tokio::test]
async fn stop_when_already_stopped_is_a_noop() {
    let (controller, store, _bus) = controller_with(settings(), "100").await;
    assert!(controller.stop().await);
    assert_eq!(controller.status(), DaemonStatus::Stopped);
    assert!(store.get("main").await.expect("get").is_none());
}

#[tokio::test]
async fn restart_runs_a_full_cycle() {
    let (controller, store, _bus) = controller_with(settings(), "100").await;
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    controller.register_service(TestService::ok("scheduler", log.clone()), ServiceGate::Always);

    assert!(controller.start().await);
    assert!(controller.restart().await);
    assert_eq!(controller.status(), DaemonStatus::Running);

    assert_eq!(
        *log.lock().expect("log lock"),
        vec!["start:scheduler", "stop:scheduler", "start:scheduler"]
    );

    let state = store.get("main").await.expect("get").expect("row");
    assert_eq!(state.status, DaemonStatus::Running);
    controller.stop().await;
}

// ---------------------------------------------------------------------------
// get_info
// ---------------------------------------------------------------------------

#[tokio::test]
async fn info_reflects_local_status_while_started_here() {
    let (controller, _store, _bus) = controller_with(settings(), "100").await;
    assert!(controller.start().await);

    let info = controller.get_info().await.expect("info");
    assert_eq!(info.status, DaemonStatus::Running);
    assert_eq!(info.process_id.as_deref(), Some("100"));
    controller.stop().await;
}

#[tokio::test]
async fn info_for_an_absent_row_reads_stopped() {
    let (controller, _store, _bus) = controller_with(settings(), "100").await;
    let info = controller.get_info().await.expect("info");
    assert_eq!(info.status, DaemonStatus::Stopped);
    assert!(info.process_id.is_none());
}

#[tokio::test]
async fn observer_derives_status_from_the_row() {
    let (owner, store, _bus) = controller_with(settings(), "100").await;
    assert!(owner.start().await);

    // A process that never called start() sees the owner's row.
    let (observer, _store, _bus2) = build_controller(store.clone(), settings(), "200");
    let info = observer.get_info().await.expect("info");
    assert_eq!(info.status, DaemonStatus::Running);
    assert_eq!(info.process_id.as_deref(), Some("100"));
    owner.stop().await;
}

#[tokio::test]
async fn observer_reads_a_stale_running_row_as_error() {
    let store = Arc::new(AgentStateStore::new_in_memory().await.expect("store"));
    let crashed = ProcessIdentity::new("100", "gone-host");
    store.ensure_exists("main", 1000).await.expect("ensure");
    store.adopt("main", &crashed, 1000).await.expect("adopt");
    store.mark_started("main", &crashed).await.expect("start");

    // Short threshold so the just-written heartbeat ages past it.
    let cfg = DaemonSettings {
        heartbeat_interval_ms: 10,
        stale_threshold_ms: 10,
        ..settings()
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let (observer, _store, _bus) = build_controller(store, cfg, "200");
    let info = observer.get_info().await.expect("info");
    assert_eq!(
        info.status,
        DaemonStatus::Error,
        "running row with stale heartbeat ({:?} vs now {}) must read as a crash",
        info.last_heartbeat_at,
        Utc::now()
    );
}
