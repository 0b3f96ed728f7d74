//! Per-app supervision: instance history, active-instance hand-off and the
//! reconciliation loop
//!
//! An [`App`] owns the ordered history of every instance it ever started and
//! the single active instance that receives new traffic. The reconciliation
//! loop is the only writer of instance statuses and the active pointer; the
//! request path only reads the pointer under its dedicated lock and pins the
//! chosen instance with an RAII [`Reservation`].

use crate::config::AppConfig;
use crate::error::Error;
use crate::instance::{Instance, InstanceStatus};
use crate::ports::PortPool;
use crate::process::Launcher;
use crate::report::{order_actionable_first, AppReport, InstanceReport};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Cadence of the reconciliation loop.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(1);

/// One supervised application.
pub struct App {
    config: Arc<AppConfig>,
    /// Append-only instance history, oldest first.
    instances: Mutex<Vec<Arc<Instance>>>,
    /// The sole target of new traffic. Its own lock, kept to pointer
    /// reads and swaps; proxy I/O never happens under it.
    active: Mutex<Option<Arc<Instance>>>,
    ports: Arc<PortPool>,
    launcher: Arc<dyn Launcher>,
    next_id: AtomicU32,
    /// Restart attempts since the last successful promotion.
    restarts: AtomicU32,
}

impl App {
    pub fn new(config: AppConfig, ports: Arc<PortPool>, launcher: Arc<dyn Launcher>) -> Arc<Self> {
        Arc::new(Self {
            config: Arc::new(config),
            instances: Mutex::new(Vec::new()),
            active: Mutex::new(None),
            ports,
            launcher,
            next_id: AtomicU32::new(0),
            restarts: AtomicU32::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Lease a port, render the command and spawn one new instance in
    /// `Starting`. Also the control surface's `start`/`restart` operation:
    /// the replacement displaces the current active on promotion.
    pub fn start_new_instance(&self) -> Result<u32, Error> {
        let port = self.ports.allocate()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let spec = self.config.launch_spec(id, port);

        match self.launcher.spawn(&spec) {
            Ok(process) => {
                let instance = Arc::new(Instance::new(id, port, Arc::clone(&self.config), process));
                self.instances.lock().push(instance);
                info!(app = %self.config.name, instance = id, port, "Started new instance");
                Ok(id)
            }
            Err(e) => {
                self.ports.release(port);
                Err(Error::Spawn(e))
            }
        }
    }

    /// Stop (or kill) every starting/serving instance, optionally narrowed
    /// to one instance id.
    pub fn stop_instances(&self, instance_id: Option<u32>, kill: bool) -> Result<(), Error> {
        let instances: Vec<Arc<Instance>> = self.instances.lock().iter().cloned().collect();
        let mut stopped = false;

        for instance in instances {
            if instance_id.is_some_and(|id| instance.id != id) {
                continue;
            }
            if matches!(
                instance.status(),
                InstanceStatus::Serving | InstanceStatus::Starting
            ) {
                stopped = true;
                if kill {
                    instance.kill();
                } else {
                    instance.stop();
                }
            }
        }

        if stopped {
            Ok(())
        } else {
            Err(Error::InstanceNotRunning)
        }
    }

    /// Reserve the active instance for one request.
    ///
    /// Selecting the target and marking it in use happen under the active
    /// lock, so a concurrent promotion can displace the instance but never
    /// invalidate an already-taken reservation mid-request.
    pub fn reserve_instance(&self) -> Result<Reservation, Error> {
        let active = self.active.lock();
        let instance = active.as_ref().ok_or(Error::NoActiveInstances)?;
        instance.serve();
        Ok(Reservation {
            instance: Arc::clone(instance),
        })
    }

    /// Currently active instance id, if any.
    pub fn active_instance_id(&self) -> Option<u32> {
        self.active.lock().as_ref().map(|instance| instance.id)
    }

    /// One reconciliation pass over the whole instance history.
    pub async fn reconcile_once(&self) {
        let instances: Vec<Arc<Instance>> = self.instances.lock().iter().cloned().collect();

        for instance in &instances {
            let status = instance.update_status().await;

            // Return the lease first so a replacement spawned later in this
            // pass can reuse the port.
            instance.maybe_release_port(&self.ports);

            let is_active = {
                let active = self.active.lock();
                active.as_ref().is_some_and(|a| Arc::ptr_eq(a, instance))
            };

            if is_active {
                if status != InstanceStatus::Serving {
                    // Reject new requests immediately rather than routing
                    // to a dead target.
                    *self.active.lock() = None;
                    warn!(app = %self.config.name, instance = instance.id, %status,
                        "Active instance no longer serving, routing suspended");
                }
            } else if status == InstanceStatus::Serving {
                let previous = {
                    let mut active = self.active.lock();
                    active.replace(Arc::clone(instance))
                };
                self.restarts.store(0, Ordering::SeqCst);
                info!(app = %self.config.name, instance = instance.id,
                    "Instance promoted to active");
                // Retire the displaced instance outside the lock; it drains
                // while the new active already takes the traffic.
                if let Some(previous) = previous {
                    previous.stop();
                }
            }

            if instance.restart_eligible() {
                self.consider_restart(instance);
            }
        }
    }

    /// Bounded restart policy for one just-terminated instance.
    fn consider_restart(&self, terminated: &Instance) {
        let used = self.restarts.load(Ordering::SeqCst);
        if used >= self.config.max_retries {
            terminated.mark_restart_handled();
            debug!(app = %self.config.name, instance = terminated.id,
                max_retries = self.config.max_retries,
                "Retry budget exhausted, no further automatic restarts");
            return;
        }

        // The attempt consumes budget whether or not the spawn succeeds; a
        // failed spawn leaves the termination eligible for the next tick.
        self.restarts.store(used + 1, Ordering::SeqCst);
        match self.start_new_instance() {
            Ok(replacement) => {
                terminated.mark_restart_handled();
                info!(app = %self.config.name, terminated = terminated.id, replacement,
                    retry = used + 1, max_retries = self.config.max_retries,
                    "Started replacement instance");
            }
            Err(e) => {
                warn!(app = %self.config.name, instance = terminated.id, error = %e,
                    "Replacement attempt failed, retrying next tick");
            }
        }
    }

    /// Drive the reconciliation loop until the app is torn down.
    pub async fn run_reconcile(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.reconcile_once().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!(app = %self.config.name, "Reconciliation loop stopped");
                        break;
                    }
                }
            }
        }
    }

    /// Snapshot the most recent `tail` instances, actionable first. A zero
    /// tail yields an empty report.
    pub fn report(&self, tail: usize) -> AppReport {
        let mut reports: Vec<InstanceReport> = {
            let instances = self.instances.lock();
            let from = instances.len().saturating_sub(tail);
            instances[from..]
                .iter()
                .map(|instance| {
                    InstanceReport::new(
                        instance.id,
                        instance.status(),
                        instance.port(),
                        instance.started_at(),
                        instance.exited_at(),
                        instance.in_flight(),
                    )
                })
                .collect()
        };
        order_actionable_first(&mut reports);

        AppReport {
            name: self.config.name.clone(),
            host: self.config.external_host.clone(),
            port: self.config.external_port,
            instances: reports,
        }
    }
}

/// An active-instance reservation held for the duration of one proxied
/// request. Dropping it releases the in-flight count exactly once, on every
/// exit path.
pub struct Reservation {
    instance: Arc<Instance>,
}

impl Reservation {
    pub fn instance_id(&self) -> u32 {
        self.instance.id
    }

    pub fn internal_host_port(&self) -> &str {
        self.instance.internal_host_port()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.instance.done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testutil::FakeLauncher;
    use std::sync::atomic::Ordering as AtomicOrdering;

    fn make_app(config: AppConfig, launcher: Arc<FakeLauncher>) -> Arc<App> {
        let ports = Arc::new(PortPool::new(10000, 10100));
        App::new(config, ports, launcher)
    }

    fn healthy_config() -> AppConfig {
        AppConfig::for_tests("web")
    }

    fn unhealthy_config() -> AppConfig {
        let mut config = AppConfig::for_tests("web");
        config.healthcheck = Some("false".to_string());
        config
    }

    #[tokio::test]
    async fn test_first_healthy_instance_promoted() {
        let launcher = Arc::new(FakeLauncher::well_behaved());
        let app = make_app(healthy_config(), Arc::clone(&launcher));

        let id = app.start_new_instance().unwrap();
        assert_eq!(app.active_instance_id(), None);

        app.reconcile_once().await;
        assert_eq!(app.active_instance_id(), Some(id));
    }

    #[tokio::test]
    async fn test_rollover_promotes_before_retiring() {
        let launcher = Arc::new(FakeLauncher::well_behaved());
        let app = make_app(healthy_config(), Arc::clone(&launcher));

        let a = app.start_new_instance().unwrap();
        app.reconcile_once().await;
        assert_eq!(app.active_instance_id(), Some(a));

        // A request reserved against A before the rollover.
        let reservation = app.reserve_instance().unwrap();
        assert_eq!(reservation.instance_id(), a);

        let b = app.start_new_instance().unwrap();
        app.reconcile_once().await;

        // B took over; A was told to drain, not killed.
        assert_eq!(app.active_instance_id(), Some(b));
        assert!(!launcher.handle(0).signals().is_empty());
        assert_eq!(launcher.handle(0).kill_count(), 0);

        // New traffic routes to B while the old reservation completes.
        let fresh = app.reserve_instance().unwrap();
        assert_eq!(fresh.instance_id(), b);
        drop(fresh);
        drop(reservation);

        // A (well behaved) exited on its stop signal; next tick observes it.
        app.reconcile_once().await;
        let report = app.report(10);
        let a_status = report
            .instances
            .iter()
            .find(|r| r.id == a)
            .unwrap()
            .status
            .clone();
        assert_eq!(a_status, "exited");
        // Graceful retirement spawns no replacement.
        assert_eq!(launcher.spawn_count(), 2);
    }

    #[tokio::test]
    async fn test_active_cleared_when_instance_dies() {
        let launcher = Arc::new(FakeLauncher::well_behaved());
        let app = make_app(healthy_config(), Arc::clone(&launcher));

        app.start_new_instance().unwrap();
        app.reconcile_once().await;
        assert!(app.active_instance_id().is_some());

        launcher.handle(0).exit();
        app.reconcile_once().await;

        // Routing suspended the moment the active died; the replacement is
        // still starting.
        assert_eq!(app.active_instance_id(), None);
        assert!(matches!(
            app.reserve_instance(),
            Err(Error::NoActiveInstances)
        ));
        assert_eq!(launcher.spawn_count(), 2);
    }

    #[tokio::test]
    async fn test_retry_budget_bounds_spawn_attempts() {
        let launcher = Arc::new(FakeLauncher::default());
        launcher.exit_immediately.store(true, AtomicOrdering::SeqCst);
        let mut config = unhealthy_config();
        config.max_retries = 2;
        let app = make_app(config, Arc::clone(&launcher));

        app.start_new_instance().unwrap();
        for _ in 0..6 {
            app.reconcile_once().await;
            assert_eq!(app.active_instance_id(), None);
            assert!(matches!(
                app.reserve_instance(),
                Err(Error::NoActiveInstances)
            ));
        }

        // Initial attempt plus exactly max_retries replacements.
        assert_eq!(launcher.spawn_count(), 3);
    }

    #[tokio::test]
    async fn test_retry_counter_resets_on_promotion() {
        let launcher = Arc::new(FakeLauncher::well_behaved());
        launcher.exit_immediately.store(true, AtomicOrdering::SeqCst);
        let mut config = healthy_config();
        config.max_retries = 2;
        let app = make_app(config, Arc::clone(&launcher));

        // Burn one retry on a crash.
        app.start_new_instance().unwrap();
        app.reconcile_once().await;
        assert_eq!(launcher.spawn_count(), 2);

        // The replacement survives and gets promoted.
        launcher.exit_immediately.store(false, AtomicOrdering::SeqCst);
        app.reconcile_once().await;
        app.reconcile_once().await;
        let active = app.active_instance_id();
        assert!(active.is_some());

        // A fresh failure lineage has the full budget again.
        launcher.exit_immediately.store(true, AtomicOrdering::SeqCst);
        let spawns_before = launcher.spawn_count();
        launcher.handle(spawns_before - 1).exit();
        for _ in 0..6 {
            app.reconcile_once().await;
        }
        assert_eq!(launcher.spawn_count(), spawns_before + 2);
    }

    #[tokio::test]
    async fn test_failed_spawn_retries_next_tick() {
        let launcher = Arc::new(FakeLauncher::default());
        launcher.exit_immediately.store(true, AtomicOrdering::SeqCst);
        let mut config = unhealthy_config();
        config.max_retries = 3;
        let app = make_app(config, Arc::clone(&launcher));

        app.start_new_instance().unwrap();
        launcher.fail_spawns.store(true, AtomicOrdering::SeqCst);
        app.reconcile_once().await;
        // Attempt consumed budget but produced nothing.
        assert_eq!(launcher.spawn_count(), 1);

        launcher.fail_spawns.store(false, AtomicOrdering::SeqCst);
        app.reconcile_once().await;
        assert_eq!(launcher.spawn_count(), 2);
    }

    #[tokio::test]
    async fn test_port_leases_disjoint_among_live_instances() {
        let launcher = Arc::new(FakeLauncher::default());
        launcher.exit_immediately.store(true, AtomicOrdering::SeqCst);
        let mut config = unhealthy_config();
        config.max_retries = 4;
        let app = make_app(config, Arc::clone(&launcher));

        app.start_new_instance().unwrap();
        for _ in 0..6 {
            app.reconcile_once().await;
        }

        let specs = launcher.specs.lock();
        let report = app.report(10);
        // Every live (non-terminal) instance holds a distinct port.
        let mut live_ports: Vec<u16> = report
            .instances
            .iter()
            .filter(|r| r.status != "exited" && r.status != "failed"
                && r.status != "timed_out" && r.status != "killed")
            .map(|r| r.port)
            .collect();
        live_ports.sort_unstable();
        live_ports.dedup();
        assert_eq!(
            live_ports.len(),
            report
                .instances
                .iter()
                .filter(|r| r.status == "starting" || r.status == "serving" || r.status == "stopping")
                .count()
        );
        assert_eq!(specs.len(), 5);
    }

    #[tokio::test]
    async fn test_dead_instance_port_is_reused() {
        let launcher = Arc::new(FakeLauncher::default());
        launcher.exit_immediately.store(true, AtomicOrdering::SeqCst);
        let ports = Arc::new(PortPool::new(10000, 10001));
        let mut config = unhealthy_config();
        config.max_retries = 3;
        let app = App::new(
            config,
            Arc::clone(&ports),
            Arc::clone(&launcher) as Arc<dyn Launcher>,
        );

        app.start_new_instance().unwrap();

        // Single-port pool: each replacement can only spawn because the
        // previous instance's lease was released after reaping.
        for _ in 0..3 {
            app.reconcile_once().await;
        }
        assert!(launcher.spawn_count() >= 2);
        for spec in launcher.specs.lock().iter() {
            assert!(spec.command.contains("10000"));
        }
    }

    #[tokio::test]
    async fn test_stop_instances_filters_and_errors() {
        let launcher = Arc::new(FakeLauncher::well_behaved());
        let app = make_app(healthy_config(), Arc::clone(&launcher));

        assert!(matches!(
            app.stop_instances(None, false),
            Err(Error::InstanceNotRunning)
        ));

        let a = app.start_new_instance().unwrap();
        let b = app.start_new_instance().unwrap();

        // Unknown id matches nothing.
        assert!(matches!(
            app.stop_instances(Some(999), false),
            Err(Error::InstanceNotRunning)
        ));

        app.stop_instances(Some(a), false).unwrap();
        assert!(!launcher.handle(0).signals().is_empty());
        assert!(launcher.handle(1).signals().is_empty());

        app.stop_instances(Some(b), true).unwrap();
        assert_eq!(launcher.handle(1).kill_count(), 1);
    }

    #[tokio::test]
    async fn test_reservation_releases_in_flight_on_drop() {
        let launcher = Arc::new(FakeLauncher::well_behaved());
        let app = make_app(healthy_config(), Arc::clone(&launcher));
        app.start_new_instance().unwrap();
        app.reconcile_once().await;

        {
            let _first = app.reserve_instance().unwrap();
            let _second = app.reserve_instance().unwrap();
            let report = app.report(10);
            assert_eq!(report.instances[0].in_flight, 2);
        }

        let report = app.report(10);
        assert_eq!(report.instances[0].in_flight, 0);
    }

    #[tokio::test]
    async fn test_report_tail_is_bounded() {
        let launcher = Arc::new(FakeLauncher::default());
        launcher.exit_immediately.store(true, AtomicOrdering::SeqCst);
        let mut config = unhealthy_config();
        config.max_retries = 5;
        let app = make_app(config, Arc::clone(&launcher));

        app.start_new_instance().unwrap();
        for _ in 0..8 {
            app.reconcile_once().await;
        }
        assert_eq!(launcher.spawn_count(), 6);

        let report = app.report(3);
        assert_eq!(report.instances.len(), 3);

        // A zero tail is honored, not rounded up.
        assert!(app.report(0).instances.is_empty());
    }
}
