//! Instance lifecycle state machine
//!
//! One [`Instance`] is one spawned process attempt: a leased internal port, a
//! process handle, an in-flight request counter and a status that only the
//! app's reconciliation loop advances (plus explicit `stop`/`kill` requests
//! from the control surface). Request-serving tasks touch an instance solely
//! through `serve`/`done` after it was handed out under the app's
//! active-instance lock.

use crate::config::{AppConfig, PORT_BADGE};
use crate::ports::PortPool;
use crate::process::Process;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// How long a single health probe may take before counting as unhealthy.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Launched, health probe not yet green.
    Starting,
    /// Healthy and eligible to be the app's active instance.
    Serving,
    /// Displaced or explicitly stopped; draining in-flight requests.
    Stopping,
    /// Exited after a graceful stop.
    Exited,
    /// Process died before or while it should have been running.
    Failed,
    /// Never became healthy within the start timeout.
    TimedOut,
    /// Forcefully terminated.
    Killed,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceStatus::Exited
                | InstanceStatus::Failed
                | InstanceStatus::TimedOut
                | InstanceStatus::Killed
        )
    }

    /// Statuses worth surfacing first in status reports.
    pub fn is_actionable(self) -> bool {
        matches!(
            self,
            InstanceStatus::Starting | InstanceStatus::Serving | InstanceStatus::Stopping
        )
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InstanceStatus::Starting => "starting",
            InstanceStatus::Serving => "serving",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Exited => "exited",
            InstanceStatus::Failed => "failed",
            InstanceStatus::TimedOut => "timed_out",
            InstanceStatus::Killed => "killed",
        };
        f.write_str(name)
    }
}

struct State {
    status: InstanceStatus,
    /// Monotonic start instant, for start-timeout detection.
    started: Instant,
    started_at: DateTime<Utc>,
    /// When the stop signal was delivered; bounds the graceful drain.
    stop_sent: Option<Instant>,
    /// Set by `stop`/`kill`; terminations after an explicit or displacement
    /// stop never feed the restart policy.
    stop_requested: bool,
    exited_at: Option<DateTime<Utc>>,
    port_released: bool,
}

/// One process attempt for an app.
pub struct Instance {
    pub id: u32,
    port: u16,
    internal_host_port: String,
    config: Arc<AppConfig>,
    process: Mutex<Box<dyn Process>>,
    state: Mutex<State>,
    /// Requests currently proxied to this instance, incremented from
    /// arbitrary request tasks.
    in_flight: AtomicU32,
    /// Ensures one termination consumes at most one successful restart.
    restart_handled: AtomicBool,
}

impl Instance {
    pub fn new(id: u32, port: u16, config: Arc<AppConfig>, process: Box<dyn Process>) -> Self {
        Self {
            id,
            port,
            internal_host_port: config.internal_host_port(port),
            config,
            process: Mutex::new(process),
            state: Mutex::new(State {
                status: InstanceStatus::Starting,
                started: Instant::now(),
                started_at: Utc::now(),
                stop_sent: None,
                stop_requested: false,
                exited_at: None,
                port_released: false,
            }),
            in_flight: AtomicU32::new(0),
            restart_handled: AtomicBool::new(false),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn internal_host_port(&self) -> &str {
        &self.internal_host_port
    }

    pub fn status(&self) -> InstanceStatus {
        self.state.lock().status
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.state.lock().started_at
    }

    pub fn exited_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().exited_at
    }

    /// Mark one request in flight. Must only be called while this instance
    /// is reserved as the app's active instance (under the active lock).
    pub fn serve(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    /// Release one in-flight reservation.
    pub fn done(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Advance the state machine by one reconcile tick.
    ///
    /// This is the single status writer apart from explicit `stop`/`kill`;
    /// health probes, exit detection and both timeouts all happen here, never
    /// on the request path.
    pub async fn update_status(&self) -> InstanceStatus {
        match self.status() {
            InstanceStatus::Starting => {
                if self.process_exited() {
                    let code = self.process.lock().exit_code();
                    warn!(app = %self.config.name, instance = self.id, exit_code = ?code,
                        "Process exited before becoming healthy");
                    return self.transition(InstanceStatus::Failed);
                }
                let elapsed = self.state.lock().started.elapsed();
                if elapsed > self.config.start_timeout() {
                    warn!(app = %self.config.name, instance = self.id,
                        timeout_secs = self.config.start_timeout().as_secs(),
                        "Start timeout exceeded, force-terminating");
                    self.process.lock().start_kill();
                    return self.transition(InstanceStatus::TimedOut);
                }
                if self.probe_health().await {
                    return self.transition(InstanceStatus::Serving);
                }
                InstanceStatus::Starting
            }
            InstanceStatus::Serving => {
                if self.process_exited() {
                    let code = self.process.lock().exit_code();
                    warn!(app = %self.config.name, instance = self.id, exit_code = ?code,
                        "Process exited unexpectedly");
                    return self.transition(InstanceStatus::Failed);
                }
                InstanceStatus::Serving
            }
            InstanceStatus::Stopping => {
                if self.process_exited() {
                    return self.transition(InstanceStatus::Exited);
                }
                let overdue = self
                    .state
                    .lock()
                    .stop_sent
                    .is_some_and(|sent| sent.elapsed() > self.config.stop_timeout());
                if overdue && self.in_flight() == 0 {
                    warn!(app = %self.config.name, instance = self.id,
                        "Stop timeout exceeded and drain complete, force-terminating");
                    self.process.lock().start_kill();
                    return self.transition(InstanceStatus::Killed);
                }
                InstanceStatus::Stopping
            }
            terminal => terminal,
        }
    }

    /// Request a graceful stop: deliver the configured stop signal and start
    /// draining. No effect once stopping or terminal.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if !matches!(
            state.status,
            InstanceStatus::Starting | InstanceStatus::Serving
        ) {
            return;
        }
        let signal = self.config.stop_signal;
        if let Err(e) = self.process.lock().signal(signal) {
            warn!(app = %self.config.name, instance = self.id, %signal, error = %e,
                "Failed to deliver stop signal");
        }
        info!(app = %self.config.name, instance = self.id, %signal,
            in_flight = self.in_flight(), "Stopping instance");
        state.status = InstanceStatus::Stopping;
        state.stop_sent = Some(Instant::now());
        state.stop_requested = true;
    }

    /// Immediate, unconditional termination regardless of in-flight state.
    pub fn kill(&self) {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return;
        }
        info!(app = %self.config.name, instance = self.id, "Killing instance");
        self.process.lock().start_kill();
        state.status = InstanceStatus::Killed;
        state.stop_requested = true;
        state.exited_at = Some(Utc::now());
    }

    /// Whether this termination should feed the restart policy. True at most
    /// once per instance, and never for stop/kill-requested terminations.
    pub fn restart_eligible(&self) -> bool {
        let state = self.state.lock();
        matches!(
            state.status,
            InstanceStatus::Exited | InstanceStatus::Failed | InstanceStatus::TimedOut
        ) && !state.stop_requested
            && !self.restart_handled.load(Ordering::SeqCst)
    }

    /// Record that this termination has been answered with a replacement (or
    /// that the retry budget is exhausted).
    pub fn mark_restart_handled(&self) {
        self.restart_handled.store(true, Ordering::SeqCst);
    }

    /// Return the port lease once this instance is terminal, its process is
    /// reaped and the drain finished. Idempotent.
    pub fn maybe_release_port(&self, pool: &PortPool) {
        {
            let state = self.state.lock();
            if !state.status.is_terminal() || state.port_released {
                return;
            }
        }
        if self.in_flight() != 0 || !self.process.lock().has_exited() {
            return;
        }
        let mut state = self.state.lock();
        if state.port_released {
            return;
        }
        state.port_released = true;
        pool.release(self.port);
        debug!(app = %self.config.name, instance = self.id, port = self.port,
            "Instance retired, port returned");
    }

    fn process_exited(&self) -> bool {
        self.process.lock().has_exited()
    }

    fn transition(&self, to: InstanceStatus) -> InstanceStatus {
        let mut state = self.state.lock();
        if state.status == to {
            return to;
        }
        info!(app = %self.config.name, instance = self.id,
            from = %state.status, to = %to, "Instance status changed");
        state.status = to;
        if to.is_terminal() && state.exited_at.is_none() {
            state.exited_at = Some(Utc::now());
        }
        to
    }

    async fn probe_health(&self) -> bool {
        match self.config.healthcheck.as_deref() {
            Some(path) if path.starts_with('/') => {
                http_probe(&self.internal_host_port, path).await
            }
            Some(command) => command_probe(command, self.port).await,
            None => tcp_probe(&self.internal_host_port).await,
        }
    }
}

/// Bare TCP connect probe.
async fn tcp_probe(host_port: &str) -> bool {
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(host_port)).await,
        Ok(Ok(_))
    )
}

/// Minimal HTTP GET probe; healthy on any 2xx status line.
async fn http_probe(host_port: &str, path: &str) -> bool {
    let connect = tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(host_port)).await;
    let mut stream = match connect {
        Ok(Ok(s)) => s,
        _ => return false,
    };

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host_port
    );
    if stream.write_all(request.as_bytes()).await.is_err() {
        return false;
    }

    let read = tokio::time::timeout(PROBE_TIMEOUT, async {
        let mut reader = BufReader::new(stream);
        let mut status_line = String::new();
        reader.read_line(&mut status_line).await?;
        Ok::<_, std::io::Error>(status_line)
    })
    .await;

    match read {
        Ok(Ok(status_line)) => status_line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
            .map(|code| (200..300).contains(&code))
            .unwrap_or(false),
        _ => false,
    }
}

/// Run the configured health command with `{port}` substituted; exit code 0
/// means healthy.
async fn command_probe(command: &str, port: u16) -> bool {
    let rendered = command.replace(PORT_BADGE, &port.to_string());
    let argv = match shell_words::split(&rendered) {
        Ok(argv) if !argv.is_empty() => argv,
        _ => return false,
    };

    let mut cmd = tokio::process::Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true);

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(_) => return false,
    };

    match tokio::time::timeout(PROBE_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) => output.status.success(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testutil::fake_process;
    use crate::process::Signal;

    fn make_instance(config: AppConfig) -> (Instance, crate::process::testutil::FakeHandle) {
        let (process, handle) = fake_process();
        (Instance::new(1, 10000, Arc::new(config), process), handle)
    }

    #[tokio::test]
    async fn test_starting_to_serving_on_healthy_probe() {
        let (instance, _handle) = make_instance(AppConfig::for_tests("web"));
        assert_eq!(instance.status(), InstanceStatus::Starting);
        assert_eq!(instance.update_status().await, InstanceStatus::Serving);
    }

    #[tokio::test]
    async fn test_starting_stays_while_unhealthy() {
        let mut config = AppConfig::for_tests("web");
        config.healthcheck = Some("false".to_string());
        let (instance, _handle) = make_instance(config);
        assert_eq!(instance.update_status().await, InstanceStatus::Starting);
        assert_eq!(instance.update_status().await, InstanceStatus::Starting);
    }

    #[tokio::test]
    async fn test_starting_to_failed_on_early_exit() {
        let mut config = AppConfig::for_tests("web");
        config.healthcheck = Some("false".to_string());
        let (instance, handle) = make_instance(config);
        handle.exit();
        assert_eq!(instance.update_status().await, InstanceStatus::Failed);
        assert!(instance.restart_eligible());
        assert!(instance.exited_at().is_some());
    }

    #[tokio::test]
    async fn test_starting_to_timed_out_force_kills() {
        let mut config = AppConfig::for_tests("web");
        config.healthcheck = Some("false".to_string());
        config.start_timeout_secs = 0;
        let (instance, handle) = make_instance(config);
        assert_eq!(instance.update_status().await, InstanceStatus::TimedOut);
        assert_eq!(handle.kill_count(), 1);
        assert!(instance.restart_eligible());
    }

    #[tokio::test]
    async fn test_serving_to_failed_on_unexpected_exit() {
        let (instance, handle) = make_instance(AppConfig::for_tests("web"));
        assert_eq!(instance.update_status().await, InstanceStatus::Serving);
        handle.exit();
        assert_eq!(instance.update_status().await, InstanceStatus::Failed);
        assert!(instance.restart_eligible());
    }

    #[tokio::test]
    async fn test_graceful_stop_path() {
        let (instance, handle) = make_instance(AppConfig::for_tests("web"));
        instance.update_status().await;

        instance.stop();
        assert_eq!(instance.status(), InstanceStatus::Stopping);
        assert_eq!(handle.signals(), vec![Signal::Term]);

        // Still draining while the process is alive.
        assert_eq!(instance.update_status().await, InstanceStatus::Stopping);

        handle.exit();
        assert_eq!(instance.update_status().await, InstanceStatus::Exited);
        // Graceful retirement never triggers the restart policy.
        assert!(!instance.restart_eligible());
    }

    #[tokio::test]
    async fn test_stop_timeout_escalates_to_kill_after_drain() {
        let mut config = AppConfig::for_tests("web");
        config.stop_timeout_secs = 0;
        let (instance, handle) = make_instance(config);
        instance.update_status().await;

        instance.serve();
        instance.stop();

        // In-flight request holds off the escalation even past the timeout.
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(instance.update_status().await, InstanceStatus::Stopping);
        assert_eq!(handle.kill_count(), 0);

        instance.done();
        assert_eq!(instance.update_status().await, InstanceStatus::Killed);
        assert_eq!(handle.kill_count(), 1);
        assert!(!instance.restart_eligible());
    }

    #[tokio::test]
    async fn test_kill_is_unconditional() {
        let (instance, handle) = make_instance(AppConfig::for_tests("web"));
        instance.update_status().await;
        instance.serve();

        instance.kill();
        assert_eq!(instance.status(), InstanceStatus::Killed);
        assert_eq!(handle.kill_count(), 1);
        assert!(!instance.restart_eligible());

        // Terminal states are sticky.
        assert_eq!(instance.update_status().await, InstanceStatus::Killed);
        instance.stop();
        assert_eq!(instance.status(), InstanceStatus::Killed);
    }

    #[tokio::test]
    async fn test_port_release_waits_for_reap_and_drain() {
        let pool = PortPool::new(10000, 10001);
        let port = pool.allocate().unwrap();
        let mut config = AppConfig::for_tests("web");
        config.healthcheck = Some("false".to_string());
        let (process, handle) = fake_process();
        let instance = Instance::new(1, port, Arc::new(config), process);

        // Not terminal yet: no release.
        instance.maybe_release_port(&pool);
        assert_eq!(pool.leased_count(), 1);

        handle.exit();
        instance.update_status().await;
        instance.serve();

        // Terminal but still draining: no release.
        instance.maybe_release_port(&pool);
        assert_eq!(pool.leased_count(), 1);

        instance.done();
        instance.maybe_release_port(&pool);
        assert_eq!(pool.leased_count(), 0);

        // Idempotent.
        instance.maybe_release_port(&pool);
        assert_eq!(pool.leased_count(), 0);
    }

    #[tokio::test]
    async fn test_in_flight_counting() {
        let (instance, _handle) = make_instance(AppConfig::for_tests("web"));
        instance.serve();
        instance.serve();
        assert_eq!(instance.in_flight(), 2);
        instance.done();
        assert_eq!(instance.in_flight(), 1);
        instance.done();
        assert_eq!(instance.in_flight(), 0);
    }

    #[test]
    fn test_actionable_predicate() {
        assert!(InstanceStatus::Starting.is_actionable());
        assert!(InstanceStatus::Serving.is_actionable());
        assert!(InstanceStatus::Stopping.is_actionable());
        assert!(!InstanceStatus::Exited.is_actionable());
        assert!(!InstanceStatus::Failed.is_actionable());
        assert!(!InstanceStatus::TimedOut.is_actionable());
        assert!(!InstanceStatus::Killed.is_actionable());
    }

    #[test]
    fn test_terminal_predicate() {
        for status in [
            InstanceStatus::Exited,
            InstanceStatus::Failed,
            InstanceStatus::TimedOut,
            InstanceStatus::Killed,
        ] {
            assert!(status.is_terminal());
            assert!(!status.is_actionable());
        }
        assert!(!InstanceStatus::Serving.is_terminal());
    }
}
