use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use solo_bridge::event_bus::EventBus;
use solo_bridge::protocol::EventKind;
use solo_core::config::DaemonSettings;
use solo_core::store::AgentStateStore;
use solo_core::types::{DaemonStatus, ProcessIdentity};
use solo_daemon::services::{Service, ServiceGate, StaticSettings};
use solo_daemon::{DaemonController, HeartbeatManager, TickOutcome, Watchdog};

async fn fixture(
    settings: DaemonSettings,
) -> (Arc<DaemonController>, Arc<Watchdog>, EventBus) {
    let store = Arc::new(AgentStateStore::new_in_memory().await.expect("store"));
    fixture_over(store, settings, "100")
}

fn fixture_over(
    store: Arc<AgentStateStore>,
    settings: DaemonSettings,
    pid: &str,
) -> (Arc<DaemonController>, Arc<Watchdog>, EventBus) {
    let identity = ProcessIdentity::new(pid, "test-host");
    let bus = EventBus::new();
    let heartbeat = Arc::new(HeartbeatManager::new(
        store.clone(),
        identity.clone(),
        bus.clone(),
    ));
    let provider = Arc::new(StaticSettings::new(settings));
    let controller = Arc::new(DaemonController::new(
        "main",
        store,
        heartbeat,
        bus.clone(),
        provider.clone(),
        identity,
    ));
    let watchdog = Watchdog::new(120_000, provider, bus.clone());
    controller.attach_watchdog(&watchdog);
    (controller, watchdog, bus)
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

/// Service with configurable start/stop delays, for holding the controller
/// in a transitional state while a tick fires.
struct DelayService {
    start_delay_ms: u64,
    stop_delay_ms: u64,
}

#[async_trait]
impl Service for DelayService {
    fn name(&self) -> &str {
        "delayed"
    }

    async fn start(&self) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_millis(self.start_delay_ms)).await;
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_millis(self.stop_delay_ms)).await;
        Ok(())
    }
}

#[tokio::test]
async fn tick_restarts_a_downed_daemon() {
    let (controller, watchdog, bus) = fixture(settings()).await;
    assert_eq!(controller.status(), DaemonStatus::Stopped);

    let outcome = watchdog.tick(&controller).await;
    assert_eq!(outcome, TickOutcome::Restarted { succeeded: true });
    assert_eq!(controller.status(), DaemonStatus::Running);

    assert!(event_kinds(&bus).contains(&EventKind::WatchdogRestart));
    controller.stop().await;
}

#[tokio::test]
async fn tick_leaves_a_healthy_daemon_alone() {
    let (controller, watchdog, _bus) = fixture(settings()).await;
    assert!(controller.start().await);

    let outcome = watchdog.tick(&controller).await;
    assert_eq!(outcome, TickOutcome::Healthy);
    controller.stop().await;
}

#[tokio::test]
async fn tick_ignores_a_starting_daemon() {
    let (controller, watchdog, bus) = fixture(settings()).await;
    controller.register_service(
        Arc::new(DelayService {
            start_delay_ms: 200,
            stop_delay_ms: 0,
        }),
        ServiceGate::Always,
    );

    let starting = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.start().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(controller.status(), DaemonStatus::Starting);

    let outcome = watchdog.tick(&controller).await;
    assert_eq!(outcome, TickOutcome::Healthy);
    assert!(!event_kinds(&bus).contains(&EventKind::WatchdogRestart));

    assert!(starting.await.expect("join"));
    controller.stop().await;
}

#[tokio::test]
async fn tick_ignores_a_stopping_daemon() {
    let (controller, watchdog, bus) = fixture(settings()).await;
    controller.register_service(
        Arc::new(DelayService {
            start_delay_ms: 0,
            stop_delay_ms: 200,
        }),
        ServiceGate::Always,
    );
    assert!(controller.start().await);

    let stopping = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.stop().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(controller.status(), DaemonStatus::Stopping);

    // stop() disarmed the watchdog; re-arm to exercise the status gate the
    // way a crash-recovery tick would see it.
    watchdog.enable();
    let outcome = watchdog.tick(&controller).await;
    assert_eq!(outcome, TickOutcome::Healthy);
    assert!(!event_kinds(&bus).contains(&EventKind::WatchdogRestart));

    assert!(stopping.await.expect("join"));
    assert_eq!(controller.status(), DaemonStatus::Stopped);
}

#[tokio::test]
async fn standby_watchdog_defers_to_a_healthy_foreign_owner() {
    let store = Arc::new(AgentStateStore::new_in_memory().await.expect("store"));
    let (owner, _owner_dog, _owner_bus) = fixture_over(store.clone(), settings(), "100");
    assert!(owner.start().await);

    // A second instance that never started the daemon: its row shows the
    // healthy owner, so a tick must be a no-op, not a restart attempt.
    let (standby, standby_dog, standby_bus) = fixture_over(store.clone(), settings(), "200");
    let outcome = standby_dog.tick(&standby).await;
    assert_eq!(outcome, TickOutcome::Healthy);
    assert_eq!(standby.status(), DaemonStatus::Stopped);

    let kinds = event_kinds(&standby_bus);
    assert!(!kinds.contains(&EventKind::WatchdogRestart));
    assert!(!kinds.contains(&EventKind::Starting));
    assert!(!kinds.contains(&EventKind::LeadershipDenied));

    owner.stop().await;
}

#[tokio::test]
async fn standby_watchdog_takes_over_a_stale_owner() {
    let store = Arc::new(AgentStateStore::new_in_memory().await.expect("store"));
    let crashed = ProcessIdentity::new("100", "gone-host");
    store.ensure_exists("main", 10).await.expect("ensure");
    store.adopt("main", &crashed, 10).await.expect("adopt");
    store.mark_started("main", &crashed).await.expect("start");

    let cfg = DaemonSettings {
        heartbeat_interval_ms: 10,
        stale_threshold_ms: 10,
        ..settings()
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (standby, standby_dog, bus) = fixture_over(store.clone(), cfg, "200");
    let outcome = standby_dog.tick(&standby).await;
    assert_eq!(outcome, TickOutcome::Restarted { succeeded: true });
    assert_eq!(standby.status(), DaemonStatus::Running);
    assert!(event_kinds(&bus).contains(&EventKind::LeadershipTaken));

    let state = store.get("main").await.expect("get").expect("row");
    assert_eq!(state.process_id.as_deref(), Some("200"));
    standby.stop().await;
}

#[tokio::test]
async fn auto_start_off_means_observe_only() {
    let cfg = DaemonSettings {
        auto_start_on_boot: false,
        ..settings()
    };
    let (controller, watchdog, _bus) = fixture(cfg).await;

    let outcome = watchdog.tick(&controller).await;
    assert_eq!(outcome, TickOutcome::AutoStartOff);
    assert_eq!(controller.status(), DaemonStatus::Stopped);
}

#[tokio::test]
async fn intentional_stop_is_not_undone() {
    let (controller, watchdog, _bus) = fixture(settings()).await;
    assert!(controller.start().await);
    assert!(controller.stop().await);

    // stop() disabled the watchdog before anything else.
    assert!(!watchdog.is_enabled());
    let outcome = watchdog.tick(&controller).await;
    assert_eq!(outcome, TickOutcome::Disabled);
    assert_eq!(controller.status(), DaemonStatus::Stopped);
}

#[tokio::test]
async fn successful_start_rearms_the_watchdog() {
    let (controller, watchdog, _bus) = fixture(settings()).await;
    assert!(controller.start().await);
    assert!(controller.stop().await);
    assert!(!watchdog.is_enabled());

    assert!(controller.start().await);
    assert!(watchdog.is_enabled());

    let outcome = watchdog.tick(&controller).await;
    assert_eq!(outcome, TickOutcome::Healthy);
    controller.stop().await;
}

#[tokio::test]
async fn watchdog_restart_recovers_an_errored_daemon() {
    let (controller, watchdog, _bus) = fixture(settings()).await;
    assert!(controller.start().await);

    // Simulate a crash: the controller believes it is down but nothing ran
    // the graceful stop, so the watchdog is still armed.
    assert!(controller.stop().await);
    watchdog.enable();

    let outcome = watchdog.tick(&controller).await;
    assert_eq!(outcome, TickOutcome::Restarted { succeeded: true });
    assert_eq!(controller.status(), DaemonStatus::Running);
    controller.stop().await;
}
