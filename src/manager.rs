//! Component wiring and the scheduler: one-shot pass, periodic daemon loop, signals and cleanup.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::persistence::load_config;
use crate::config::types::{SentinelConfig, UpsConfig};
use crate::daemon;
use crate::daemon::control::send_reload_signal;
use crate::daemon::pid::{get_pid, is_running, remove_pid_file, save_pid};
use crate::network::discovery::{HostDiscovery, NetworkDiscovery};
use crate::network::nut::{NutClient, UpsVariableSource};
use crate::network::wol::{UdpWakeSender, WakeSender};
use crate::services::host::{HostDeps, HostService, ManagedHost};
use crate::services::tasks::TaskRegistry;
use crate::services::ups::UpsService;
use crate::store::datastore::{Datastore, JsonDatastore};
use crate::system::executor::{CommandExecutor, ProcessExecutor};

type SourceFactory = Box<dyn Fn(&UpsConfig) -> Box<dyn UpsVariableSource> + Send + Sync>;

/// External collaborators every component is built from.
pub struct Collaborators {
    pub executor: Arc<dyn ProcessExecutor>,
    pub discovery: Arc<dyn HostDiscovery>,
    pub wol: Arc<dyn WakeSender>,
    pub hosts_store: Arc<dyn Datastore>,
    pub ups_store: Arc<dyn Datastore>,
    pub clock: Arc<dyn Clock>,
    pub ups_source: SourceFactory,
}

impl Collaborators {
    /// Real subprocess, network and on-disk implementations.
    pub fn system(config: &SentinelConfig) -> Result<Self> {
        let executor: Arc<dyn ProcessExecutor> = Arc::new(CommandExecutor);
        let hosts_store = JsonDatastore::open(daemon::hosts_store_path()).context("Failed to open host cache")?;
        let ups_store = JsonDatastore::open(daemon::ups_store_path()).context("Failed to open UPS cache")?;

        Ok(Self {
            discovery: Arc::new(NetworkDiscovery::new(executor.clone())),
            wol: Arc::new(UdpWakeSender::new(&config.wol)?),
            executor,
            hosts_store: Arc::new(hosts_store),
            ups_store: Arc::new(ups_store),
            clock: Arc::new(SystemClock),
            ups_source: Box::new(|ups: &UpsConfig| -> Box<dyn UpsVariableSource> {
                Box::new(NutClient::new(ups.nut_host.clone(), ups.nut_port))
            }),
        })
    }
}

/// Every component built from one configuration. Rebuilt as a whole on reload.
pub struct Context {
    pub hosts: Vec<HostService>,
    pub ups_units: Vec<UpsService>,
    pub tasks: TaskRegistry,
    pub ups_poll_interval: Duration,
    pub hosts_check_interval: Duration,
}

impl Context {
    pub fn new(config: &SentinelConfig, collab: &Collaborators) -> Self {
        let tasks = TaskRegistry::new();
        let deps = HostDeps {
            executor: collab.executor.clone(),
            discovery: collab.discovery.clone(),
            wol: collab.wol.clone(),
            datastore: collab.hosts_store.clone(),
            clock: collab.clock.clone(),
            tasks: tasks.clone(),
        };

        let hosts: Vec<HostService> = config
            .hosts
            .iter()
            .map(|host| HostService::new(host.clone(), config.hosts_policy.clone(), deps.clone()))
            .collect();

        let mut ups_units = Vec::new();
        for ups in &config.ups {
            let dependents: Vec<Arc<dyn ManagedHost>> = ups
                .hosts
                .iter()
                .filter_map(|name| hosts.iter().find(|h| h.name() == name.as_str()))
                .map(|h| Arc::new(h.clone()) as Arc<dyn ManagedHost>)
                .collect();

            if dependents.is_empty() {
                warn!(ups = %ups.name, "No hosts attached to UPS. Skipping it");
                continue;
            }

            ups_units.push(UpsService::new(
                ups.clone(),
                config.ups_units_policy.clone(),
                dependents,
                (collab.ups_source)(ups),
                collab.ups_store.clone(),
                collab.clock.clone(),
            ));
        }

        info!("Initialized {} host(s) and {} UPS unit(s)", hosts.len(), ups_units.len());

        Self {
            hosts,
            ups_units,
            tasks,
            ups_poll_interval: Duration::from_secs(config.ups_poll_interval),
            hosts_check_interval: Duration::from_secs(config.hosts_check_interval),
        }
    }

    pub async fn discover_all(&self) {
        for host in &self.hosts {
            host.discover().await;
        }
    }

    pub async fn poll_all(&self) {
        for ups in &self.ups_units {
            ups.poll().await;
        }
    }

    pub async fn check_all(&self) {
        for host in &self.hosts {
            host.check().await;
        }
    }

    /// One host-check tick: refresh identity, then check.
    pub async fn refresh_and_check_all(&self) {
        for host in &self.hosts {
            host.discover().await;
            host.check().await;
        }
    }

    /// Establish a known state: discover every host, poll every UPS, check every host.
    pub async fn run_once(&self) {
        self.discover_all().await;
        self.poll_all().await;
        self.check_all().await;
    }

    /// Cancel confirmation pollers and close every UPS session.
    pub async fn teardown(&self) {
        self.tasks.shutdown().await;
        for ups in &self.ups_units {
            ups.disconnect().await;
        }
    }
}

type CleanupAction = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Actions run once on termination, in registration order.
#[derive(Default)]
pub struct CleanupQueue {
    actions: Vec<(&'static str, CleanupAction)>,
}

impl CleanupQueue {
    pub fn push<F, Fut>(&mut self, label: &'static str, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.actions.push((label, Box::new(move || action().boxed())));
    }

    pub async fn run(self) {
        for (label, action) in self.actions {
            debug!("Cleanup: {}", label);
            action().await;
        }
    }
}

/// Deadline of the next tick. An overrun restarts the schedule from `now` instead of catching up.
pub fn next_deadline(deadline: Instant, interval: Duration, now: Instant) -> Instant {
    let next = deadline + interval;
    if next < now {
        now + interval
    } else {
        next
    }
}

async fn periodic<F, Fut>(name: &'static str, interval: Duration, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut deadline = Instant::now();
    loop {
        deadline = next_deadline(deadline, interval, Instant::now());
        tokio::time::sleep_until(deadline).await;
        debug!("Running {} tick", name);
        tick().await;
    }
}

/// Launch both periodic loops against `ctx`.
fn spawn_schedules(ctx: &Arc<Context>) -> Vec<tokio::task::JoinHandle<()>> {
    let ups_ctx = ctx.clone();
    let hosts_ctx = ctx.clone();

    vec![
        tokio::spawn(periodic("UPS poll", ctx.ups_poll_interval, move || {
            let ctx = ups_ctx.clone();
            async move { ctx.poll_all().await }
        })),
        tokio::spawn(periodic("host check", ctx.hosts_check_interval, move || {
            let ctx = hosts_ctx.clone();
            async move { ctx.refresh_and_check_all().await }
        })),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Terminate(&'static str),
    Reload,
}

/// Source of the events that end one run of the service loop.
#[async_trait]
trait StopEvents: Send {
    async fn next(&mut self) -> Stop;
}

struct Signals {
    term: Signal,
    int: Signal,
    quit: Signal,
    hup: Signal,
}

impl Signals {
    fn install() -> Result<Self> {
        Ok(Self {
            term: signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?,
            int: signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?,
            quit: signal(SignalKind::quit()).context("Failed to setup SIGQUIT handler")?,
            hup: signal(SignalKind::hangup()).context("Failed to setup SIGHUP handler")?,
        })
    }
}

#[async_trait]
impl StopEvents for Signals {
    async fn next(&mut self) -> Stop {
        tokio::select! {
            _ = self.term.recv() => Stop::Terminate("SIGTERM"),
            _ = self.int.recv() => Stop::Terminate("SIGINT"),
            _ = self.quit.recv() => Stop::Terminate("SIGQUIT"),
            _ = self.hup.recv() => Stop::Reload,
        }
    }
}

/// One pass over every host and UPS, then exit.
pub async fn run_once(config: &SentinelConfig) -> Result<()> {
    let collab = Collaborators::system(config)?;
    let ctx = Context::new(config, &collab);

    ctx.run_once().await;
    ctx.teardown().await;
    Ok(())
}

/// Periodic service loop. Returns after a termination signal once cleanup has run.
pub async fn run_daemon(config_path: Option<PathBuf>, config: SentinelConfig) -> Result<()> {
    let pid_path = daemon::pid_file_path();

    if is_running(&pid_path) {
        let pid = get_pid(&pid_path).ok().flatten();
        anyhow::bail!("Sentinel HL is already running (PID: {:?})", pid);
    }

    let mut signals = Signals::install()?;
    let path = config_path.as_deref();

    serve(
        &pid_path,
        config,
        &mut signals,
        Collaborators::system,
        || load_config(path),
        Arc::new(Mutex::new(None)),
    )
    .await
}

/// Body of the daemon: write the PID marker, then build, run and rebuild contexts until told to stop.
///
/// `current` always holds the live context so the cleanup queue can tear it down.
async fn serve<B, L, Fut>(
    pid_path: &Path,
    config: SentinelConfig,
    stops: &mut dyn StopEvents,
    build: B,
    mut reload_config: L,
    current: Arc<Mutex<Option<Arc<Context>>>>,
) -> Result<()>
where
    B: Fn(&SentinelConfig) -> Result<Collaborators>,
    L: FnMut() -> Fut,
    Fut: Future<Output = Result<SentinelConfig>>,
{
    save_pid(pid_path, std::process::id())?;

    let mut cleanup = CleanupQueue::default();
    {
        let current = current.clone();
        cleanup.push("disconnect UPS units", move || async move {
            let ctx = current.lock().take();
            if let Some(ctx) = ctx {
                ctx.teardown().await;
            }
        });
    }
    {
        let pid_path = pid_path.to_path_buf();
        cleanup.push("remove PID file", move || async move {
            match remove_pid_file(&pid_path) {
                Ok(()) => info!("PID file cleaned up"),
                Err(e) => error!("Failed to remove PID file: {:#}", e),
            }
        });
    }

    let mut config = config;
    let result = loop {
        let collab = match build(&config) {
            Ok(collab) => collab,
            Err(e) => break Err(e),
        };
        let ctx = Arc::new(Context::new(&config, &collab));
        *current.lock() = Some(ctx.clone());

        info!("Running startup pass...");
        let interrupted = tokio::select! {
            _ = ctx.run_once() => None,
            stop = stops.next() => Some(stop),
        };

        let stop = match interrupted {
            Some(stop) => {
                warn!("Startup pass interrupted");
                stop
            }
            None => {
                let schedules = spawn_schedules(&ctx);
                let stop = stops.next().await;

                for handle in &schedules {
                    handle.abort();
                }
                for handle in schedules {
                    let _ = handle.await;
                }
                stop
            }
        };

        match stop {
            Stop::Terminate(name) => {
                info!("{} received, shutting down", name);
                break Ok(());
            }
            Stop::Reload => {
                info!("SIGHUP received, reinitializing");
                let old = current.lock().take();
                if let Some(old) = old {
                    old.teardown().await;
                }
                drop(ctx);

                match reload_config().await {
                    Ok(new_config) => config = new_config,
                    Err(e) => error!("Failed to reload config, keeping the previous one: {:#}", e),
                }
            }
        }
    };

    cleanup.run().await;
    info!("Sentinel HL shutdown complete");
    result
}

/// Signal the running daemon to reinitialize.
pub async fn reload(executor: &dyn ProcessExecutor, pid_path: &Path) -> Result<()> {
    send_reload_signal(executor, pid_path).await
}

/// Wipe both caches. A running daemon is told to reload so it drops its in-memory copies.
pub async fn clear_caches(
    hosts_store: &dyn Datastore,
    ups_store: &dyn Datastore,
    executor: &dyn ProcessExecutor,
    pid_path: &Path,
) -> Result<()> {
    hosts_store.clear().context("Failed to clear host cache")?;
    ups_store.clear().context("Failed to clear UPS cache")?;
    info!("Caches cleared");

    if is_running(pid_path) {
        send_reload_signal(executor, pid_path).await?;
    } else {
        debug!("Daemon not running, no reload needed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use tokio::sync::mpsc;

    use crate::clock::testing::ManualClock;
    use crate::config::persistence::parse_config;
    use crate::network::nut::testing::{vars, ScriptedSource};
    use crate::network::wol::testing::RecordingWakeSender;
    use crate::store::datastore::testing::MemoryDatastore;
    use crate::system::executor::testing::FakeExecutor;

    struct StaticDiscovery;

    #[async_trait]
    impl HostDiscovery for StaticDiscovery {
        async fn ip_by_hostname(&self, _hostname: &str) -> Result<String> {
            Ok("10.0.0.5".into())
        }

        async fn mac_by_ip(&self, _ip: &str) -> Result<String> {
            Ok("AA:BB:CC:DD:EE:05".into())
        }
    }

    /// Resolution that never answers, standing in for a hung network call.
    struct StalledDiscovery;

    #[async_trait]
    impl HostDiscovery for StalledDiscovery {
        async fn ip_by_hostname(&self, _hostname: &str) -> Result<String> {
            std::future::pending().await
        }

        async fn mac_by_ip(&self, _ip: &str) -> Result<String> {
            std::future::pending().await
        }
    }

    #[async_trait]
    impl StopEvents for mpsc::UnboundedReceiver<Stop> {
        async fn next(&mut self) -> Stop {
            self.recv().await.unwrap_or(Stop::Terminate("closed"))
        }
    }

    const CONFIG: &str = r#"
hosts:
  - name: nas
    hostname: nas.lan
  - name: desk
    ip: 10.0.0.6
    mac: "AA:BB:CC:DD:EE:06"
ups:
  - name: rack
    nut_id: eaton
    nut_host: 127.0.0.1
    hosts: [nas, desk]
  - name: orphan
    nut_id: apc
    nut_host: 127.0.0.1
    hosts: []
ups_units_policy:
  shutdown_threshold: "30%"
"#;

    fn collaborators(source: ScriptedSource, executor: Arc<FakeExecutor>) -> Collaborators {
        collaborators_with(
            &source,
            &executor,
            Arc::new(StaticDiscovery),
            &Arc::new(MemoryDatastore::default()),
            &Arc::new(MemoryDatastore::default()),
        )
    }

    /// Collaborators over stores that outlive one context, as the on-disk caches do.
    fn collaborators_with(
        source: &ScriptedSource,
        executor: &Arc<FakeExecutor>,
        discovery: Arc<dyn HostDiscovery>,
        hosts_store: &Arc<MemoryDatastore>,
        ups_store: &Arc<MemoryDatastore>,
    ) -> Collaborators {
        let source = source.clone();
        Collaborators {
            executor: executor.clone(),
            discovery,
            wol: Arc::new(RecordingWakeSender::default()),
            hosts_store: hosts_store.clone(),
            ups_store: ups_store.clone(),
            clock: Arc::new(ManualClock::at(0.0)),
            ups_source: Box::new(move |_: &UpsConfig| -> Box<dyn UpsVariableSource> { Box::new(source.clone()) }),
        }
    }

    #[test]
    fn deadline_rolls_forward() {
        let start = Instant::now();
        let interval = Duration::from_secs(10);

        assert_eq!(next_deadline(start, interval, start), start + interval);
        assert_eq!(
            next_deadline(start, interval, start + Duration::from_secs(4)),
            start + interval
        );
    }

    #[test]
    fn overrun_resets_deadline_from_now() {
        let start = Instant::now();
        let interval = Duration::from_secs(10);
        let late = start + Duration::from_secs(35);

        assert_eq!(next_deadline(start, interval, late), late + interval);
    }

    #[tokio::test]
    async fn cleanup_runs_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut queue = CleanupQueue::default();

        for label in ["disconnect", "pid"] {
            let order = order.clone();
            queue.push(label, move || async move { order.lock().push(label) });
        }
        queue.run().await;

        assert_eq!(*order.lock(), vec!["disconnect", "pid"]);
    }

    #[tokio::test(start_paused = true)]
    async fn context_skips_ups_without_hosts_and_runs_pass() {
        let config = parse_config(CONFIG).unwrap();
        let source = ScriptedSource::default();
        source.push(Ok(Some(vars("OB", 20.0))));

        let exec = Arc::new(FakeExecutor::new(|_| Ok(String::new())));
        let collab = collaborators(source.clone(), exec.clone());
        let ctx = Context::new(&config, &collab);

        assert_eq!(ctx.hosts.len(), 2);
        assert_eq!(ctx.ups_units.len(), 1);

        ctx.run_once().await;

        // Hosts are unknown when the UPS is polled, so nothing is shut down yet
        assert!(ctx.ups_units[0].hosts_halted());
        assert_eq!(exec.calls_to("ping"), 2);
        assert_eq!(ctx.hosts[0].ip().as_deref(), Some("10.0.0.5"));
        assert_eq!(ctx.hosts[0].wake_locks(), vec!["rack".to_string()]);

        ctx.teardown().await;
        assert_eq!(*source.disconnects.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reload_rebuilds_context_and_terminate_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("sentinel.pid");
        let config = parse_config(CONFIG).unwrap();

        let source = ScriptedSource::default();
        source.push(Ok(Some(vars("OB", 20.0))));
        let exec = Arc::new(FakeExecutor::new(|_| Ok(String::new())));
        let hosts_store = Arc::new(MemoryDatastore::default());
        let ups_store = Arc::new(MemoryDatastore::default());
        let builds = AtomicUsize::new(0);
        let reloads = AtomicUsize::new(0);

        let build = |_: &SentinelConfig| -> Result<Collaborators> {
            builds.fetch_add(1, Ordering::SeqCst);
            Ok(collaborators_with(
                &source,
                &exec,
                Arc::new(StaticDiscovery),
                &hosts_store,
                &ups_store,
            ))
        };
        let reload_config = || {
            reloads.fetch_add(1, Ordering::SeqCst);
            async { parse_config(CONFIG) }
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let current: Arc<Mutex<Option<Arc<Context>>>> = Arc::new(Mutex::new(None));

        let driver = {
            let current = current.clone();
            let disconnects = source.disconnects.clone();
            let pid_path = pid_path.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                assert_eq!(get_pid(&pid_path).unwrap(), Some(std::process::id()));
                let first = current.lock().clone().unwrap();
                assert!(first.ups_units[0].hosts_halted());

                tx.send(Stop::Reload).unwrap();
                tokio::time::sleep(Duration::from_secs(1)).await;

                let second = current.lock().clone().unwrap();
                assert!(!Arc::ptr_eq(&first, &second));
                assert_eq!(*disconnects.lock(), 1);

                // The halt survived the rebuild through the UPS cache and re-locked every host
                assert!(second.ups_units[0].hosts_halted());
                for host in &second.hosts {
                    assert_eq!(host.wake_locks(), vec!["rack".to_string()]);
                }

                tx.send(Stop::Terminate("SIGTERM")).unwrap();
            }
        };

        let (result, ()) = tokio::join!(
            serve(&pid_path, config, &mut rx, build, reload_config, current.clone()),
            driver
        );

        result.unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert_eq!(reloads.load(Ordering::SeqCst), 1);
        assert_eq!(*source.disconnects.lock(), 2);
        assert!(current.lock().is_none());
        assert!(!pid_path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_interrupts_startup_pass() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("sentinel.pid");
        let config = parse_config(CONFIG).unwrap();

        let source = ScriptedSource::default();
        let exec = Arc::new(FakeExecutor::new(|_| Ok(String::new())));
        let hosts_store = Arc::new(MemoryDatastore::default());
        let ups_store = Arc::new(MemoryDatastore::default());
        let build = |_: &SentinelConfig| -> Result<Collaborators> {
            Ok(collaborators_with(
                &source,
                &exec,
                Arc::new(StalledDiscovery),
                &hosts_store,
                &ups_store,
            ))
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(Stop::Terminate("SIGTERM")).unwrap();

        let served = tokio::time::timeout(
            Duration::from_secs(30),
            serve(
                &pid_path,
                config,
                &mut rx,
                build,
                || async { parse_config(CONFIG) },
                Arc::new(Mutex::new(None)),
            ),
        )
        .await;

        served.expect("startup pass should yield to the stop event").unwrap();
        assert_eq!(exec.calls_to("ping"), 0);
        assert_eq!(*source.disconnects.lock(), 1);
        assert!(!pid_path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_ticks_on_interval() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();

        let handle = tokio::spawn(periodic("test", Duration::from_secs(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        tokio::time::sleep(Duration::from_secs(35)).await;
        handle.abort();
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn clear_caches_without_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let hosts = MemoryDatastore::default();
        let ups = MemoryDatastore::default();
        hosts.set("nas", json!({"ack": true})).unwrap();
        ups.set("rack", json!({"hosts_halted": true})).unwrap();

        let exec = FakeExecutor::new(|_| Ok(String::new()));
        clear_caches(&hosts, &ups, &exec, &dir.path().join("none.pid")).await.unwrap();

        assert_eq!(hosts.get("nas"), None);
        assert_eq!(ups.get("rack"), None);
        assert_eq!(exec.calls_to("kill"), 0);
    }

    #[tokio::test]
    async fn clear_caches_signals_running_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("sentinel.pid");
        save_pid(&pid_path, std::process::id()).unwrap();

        let exec = FakeExecutor::new(|_| Ok(String::new()));
        clear_caches(&MemoryDatastore::default(), &MemoryDatastore::default(), &exec, &pid_path)
            .await
            .unwrap();

        assert_eq!(exec.calls_to("kill"), 1);
    }
}
