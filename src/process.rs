//! Process supervision seam
//!
//! The instance state machine never touches the OS directly. It drives a
//! [`Process`] capability handle (reap poll, signal, force kill) obtained from
//! a [`Launcher`], so the whole lifecycle can run against a fake backend in
//! tests. [`OsLauncher`] is the real backend: `tokio::process` spawn with the
//! child's stdout/stderr pumped into the app's log sinks.

use crate::logger;
use anyhow::Context;
use serde::Deserialize;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// Stop signal names accepted in app configuration.
///
/// Unknown names are rejected while the config is deserialized, which keeps
/// bad signal names a startup-only failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    #[default]
    Term,
    Int,
    Quit,
    Hup,
    Usr1,
    Usr2,
    Kill,
}

impl Signal {
    #[cfg(unix)]
    pub fn as_raw(self) -> i32 {
        match self {
            Signal::Term => libc::SIGTERM,
            Signal::Int => libc::SIGINT,
            Signal::Quit => libc::SIGQUIT,
            Signal::Hup => libc::SIGHUP,
            Signal::Usr1 => libc::SIGUSR1,
            Signal::Usr2 => libc::SIGUSR2,
            Signal::Kill => libc::SIGKILL,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Signal::Term => "TERM",
            Signal::Int => "INT",
            Signal::Quit => "QUIT",
            Signal::Hup => "HUP",
            Signal::Usr1 => "USR1",
            Signal::Usr2 => "USR2",
            Signal::Kill => "KILL",
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Handle to one spawned process attempt.
///
/// `has_exited` doubles as the reap poll: once it returns true the child has
/// been waited on and its port may safely be reused.
pub trait Process: Send {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking exit poll; reaps the child on the first positive answer.
    fn has_exited(&mut self) -> bool;

    /// Exit code, if the process has been reaped and exited normally.
    fn exit_code(&self) -> Option<i32>;

    /// Deliver a signal by name.
    fn signal(&mut self, signal: Signal) -> io::Result<()>;

    /// Begin forced termination. Completion is observed through `has_exited`.
    fn start_kill(&mut self);
}

/// Everything needed to launch one instance process, already rendered:
/// the `{port}` badge has been substituted into command and environment.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub app_name: String,
    pub instance_id: u32,
    pub command: String,
    pub env: Vec<(String, String)>,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
    /// Run-as uid/gid, resolved from config at startup.
    pub run_as: Option<(u32, u32)>,
}

/// Spawns processes for instances.
pub trait Launcher: Send + Sync {
    fn spawn(&self, spec: &LaunchSpec) -> anyhow::Result<Box<dyn Process>>;
}

/// A real OS child process.
pub struct OsProcess {
    child: Child,
    exit: Option<std::process::ExitStatus>,
}

impl Process for OsProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn has_exited(&mut self) -> bool {
        if self.exit.is_some() {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit = Some(status);
                true
            }
            Ok(None) => false,
            Err(_) => false,
        }
    }

    fn exit_code(&self) -> Option<i32> {
        self.exit.and_then(|s| s.code())
    }

    fn signal(&mut self, signal: Signal) -> io::Result<()> {
        #[cfg(unix)]
        {
            let Some(pid) = self.child.id() else {
                return Err(io::Error::new(io::ErrorKind::NotFound, "process already reaped"));
            };
            let rc = unsafe { libc::kill(pid as i32, signal.as_raw()) };
            if rc == 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }

        #[cfg(not(unix))]
        {
            let _ = signal;
            self.child.start_kill()
        }
    }

    fn start_kill(&mut self) {
        let _ = self.child.start_kill();
    }
}

/// Launcher backed by `tokio::process`.
///
/// The command string is split shell-style; stdout/stderr are piped into the
/// app's log files by background pump tasks, so spawning must happen inside
/// a tokio runtime.
pub struct OsLauncher;

impl Launcher for OsLauncher {
    fn spawn(&self, spec: &LaunchSpec) -> anyhow::Result<Box<dyn Process>> {
        let argv = shell_words::split(&spec.command)
            .with_context(|| format!("invalid command for app {}", spec.app_name))?;
        let (program, args) = argv
            .split_first()
            .with_context(|| format!("empty command for app {}", spec.app_name))?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        #[cfg(unix)]
        if let Some((uid, gid)) = spec.run_as {
            cmd.uid(uid);
            cmd.gid(gid);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", spec.command))?;

        if let Some(stdout) = child.stdout.take() {
            logger::spawn_line_pump(stdout, spec.stdout_log.clone(), spec.app_name.clone(), spec.instance_id);
        }
        if let Some(stderr) = child.stderr.take() {
            logger::spawn_line_pump(stderr, spec.stderr_log.clone(), spec.app_name.clone(), spec.instance_id);
        }

        let pid = child.id().unwrap_or(0);
        info!(app = %spec.app_name, instance = spec.instance_id, pid, "Process spawned");
        debug!(app = %spec.app_name, command = %spec.command, "Launch command");

        Ok(Box::new(OsProcess { child, exit: None }))
    }
}

/// Scriptable process/launcher fakes for state-machine tests.
#[cfg(test)]
pub mod testutil {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    /// Shared control handle for one fake process. Tests flip `exited` to
    /// simulate the child dying and inspect delivered signals/kills.
    #[derive(Clone, Default)]
    pub struct FakeHandle {
        pub exited: Arc<AtomicBool>,
        pub signals: Arc<Mutex<Vec<Signal>>>,
        pub kills: Arc<AtomicU32>,
        /// When set, a delivered signal makes the process exit (a well
        /// behaved child honoring its stop signal).
        pub exit_on_signal: Arc<AtomicBool>,
    }

    impl FakeHandle {
        pub fn exit(&self) {
            self.exited.store(true, Ordering::SeqCst);
        }

        pub fn kill_count(&self) -> u32 {
            self.kills.load(Ordering::SeqCst)
        }

        pub fn signals(&self) -> Vec<Signal> {
            self.signals.lock().clone()
        }
    }

    pub struct FakeProcess {
        handle: FakeHandle,
    }

    impl Process for FakeProcess {
        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        fn has_exited(&mut self) -> bool {
            self.handle.exited.load(Ordering::SeqCst)
        }

        fn exit_code(&self) -> Option<i32> {
            if self.handle.exited.load(Ordering::SeqCst) {
                Some(0)
            } else {
                None
            }
        }

        fn signal(&mut self, signal: Signal) -> io::Result<()> {
            self.handle.signals.lock().push(signal);
            if self.handle.exit_on_signal.load(Ordering::SeqCst) {
                self.handle.exited.store(true, Ordering::SeqCst);
            }
            Ok(())
        }

        fn start_kill(&mut self) {
            self.handle.kills.fetch_add(1, Ordering::SeqCst);
            self.handle.exited.store(true, Ordering::SeqCst);
        }
    }

    /// Launcher that records every spawn and hands out controllable fakes.
    #[derive(Default)]
    pub struct FakeLauncher {
        pub handles: Mutex<Vec<FakeHandle>>,
        pub specs: Mutex<Vec<LaunchSpec>>,
        pub fail_spawns: AtomicBool,
        /// Spawned processes are born dead (crash before health check).
        pub exit_immediately: AtomicBool,
        pub exit_on_signal: bool,
    }

    impl FakeLauncher {
        pub fn well_behaved() -> Self {
            Self {
                exit_on_signal: true,
                ..Self::default()
            }
        }

        pub fn spawn_count(&self) -> usize {
            self.specs.lock().len()
        }

        pub fn handle(&self, index: usize) -> FakeHandle {
            self.handles.lock()[index].clone()
        }
    }

    impl Launcher for FakeLauncher {
        fn spawn(&self, spec: &LaunchSpec) -> anyhow::Result<Box<dyn Process>> {
            if self.fail_spawns.load(Ordering::SeqCst) {
                anyhow::bail!("scripted spawn failure");
            }
            let handle = FakeHandle::default();
            handle
                .exit_on_signal
                .store(self.exit_on_signal, Ordering::SeqCst);
            if self.exit_immediately.load(Ordering::SeqCst) {
                handle.exited.store(true, Ordering::SeqCst);
            }
            self.handles.lock().push(handle.clone());
            self.specs.lock().push(spec.clone());
            Ok(Box::new(FakeProcess { handle }))
        }
    }

    /// A fake process not tied to a launcher, for direct instance tests.
    pub fn fake_process() -> (Box<dyn Process>, FakeHandle) {
        let handle = FakeHandle::default();
        (
            Box::new(FakeProcess {
                handle: handle.clone(),
            }),
            handle,
        )
    }
}
