use log::{error, info, warn};
use std::ffi::OsString;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time::Instant;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("spawn {name} ({program}) failed: {source}")]
    Spawn {
        name: String,
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("poll {name} failed: {source}")]
    Poll {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("signal {name} failed: {message}")]
    Signal { name: String, message: String },
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

/// How to start one supervised process.
#[derive(Debug, Clone)]
pub struct ChildLaunch {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    Running { pid: Option<u32> },
    Exited { code: Option<i32>, success: bool },
}

impl fmt::Display for ChildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildStatus::Running { pid: Some(pid) } => write!(f, "running(pid {})", pid),
            ChildStatus::Running { pid: None } => write!(f, "running"),
            ChildStatus::Exited {
                code: Some(code), ..
            } => write!(f, "exited({})", code),
            ChildStatus::Exited { code: None, .. } => write!(f, "exited(signal)"),
        }
    }
}

pub struct SupervisedChild {
    name: String,
    child: Child,
    pid: Option<u32>,
    exit: Option<ExitStatus>,
}

impl SupervisedChild {
    pub fn spawn(launch: &ChildLaunch) -> Result<Self> {
        let child = Command::new(&launch.program)
            .args(&launch.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                name: launch.name.clone(),
                program: launch.program.display().to_string(),
                source,
            })?;
        let pid = child.id();
        info!(
            "{} started: {} {:?} (pid {:?})",
            launch.name,
            launch.program.display(),
            launch.args,
            pid
        );
        Ok(Self {
            name: launch.name.clone(),
            child,
            pid,
            exit: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn record_exit(&mut self, status: ExitStatus) {
        if self.exit.is_some() {
            return;
        }
        if status.success() {
            info!("{} exited: {}", self.name, status);
        } else {
            error!("{} crashed: {}, not restarting", self.name, status);
        }
        self.exit = Some(status);
    }

    /// Non-blocking liveness check. An exit is logged the first time it is seen.
    pub fn poll(&mut self) -> Result<ChildStatus> {
        if self.exit.is_none() {
            match self.child.try_wait() {
                Ok(Some(status)) => self.record_exit(status),
                Ok(None) => {}
                Err(source) => {
                    return Err(SupervisorError::Poll {
                        name: self.name.clone(),
                        source,
                    })
                }
            }
        }
        Ok(match self.exit {
            Some(status) => ChildStatus::Exited {
                code: status.code(),
                success: status.success(),
            },
            None => ChildStatus::Running { pid: self.pid },
        })
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.poll(), Ok(ChildStatus::Running { .. }))
    }

    #[cfg(unix)]
    fn request_terminate(&mut self) -> Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return Ok(());
        };
        kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(|errno| {
            SupervisorError::Signal {
                name: self.name.clone(),
                message: errno.to_string(),
            }
        })
    }

    #[cfg(not(unix))]
    fn request_terminate(&mut self) -> Result<()> {
        self.child
            .start_kill()
            .map_err(|err| SupervisorError::Signal {
                name: self.name.clone(),
                message: err.to_string(),
            })
    }

    /// Asks the process to stop. Returns false when it was already gone.
    pub fn terminate(&mut self) -> bool {
        if !self.is_alive() {
            return false;
        }
        info!("sending SIGTERM to {} (pid {:?})", self.name, self.pid);
        if let Err(err) = self.request_terminate() {
            warn!("{}", err);
        }
        true
    }

    /// Waits for the exit until `deadline`, then force-kills.
    pub async fn wait_or_kill(&mut self, deadline: Instant) {
        if !self.is_alive() {
            return;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!("{} stopped within grace window", self.name);
                self.record_exit(status);
                return;
            }
            Ok(Err(err)) => warn!("wait for {} failed: {}", self.name, err),
            Err(_) => warn!("{} still alive after grace window, killing", self.name),
        }

        if let Err(err) = self.child.kill().await {
            error!("kill {} failed: {}", self.name, err);
            return;
        }
        match self.child.wait().await {
            Ok(status) => {
                info!("{} killed", self.name);
                self.record_exit(status);
            }
            Err(err) => error!("reap {} failed: {}", self.name, err),
        }
    }
}

/// Keeps both relay processes under watch. Crashes are reported, never restarted.
pub struct Supervisor {
    children: Vec<SupervisedChild>,
    poll_interval: Duration,
    grace: Duration,
}

impl Supervisor {
    pub fn start(launches: &[ChildLaunch], poll_interval: Duration, grace: Duration) -> Result<Self> {
        let mut children = Vec::with_capacity(launches.len());
        for launch in launches {
            // already started children are killed on drop if this fails
            children.push(SupervisedChild::spawn(launch)?);
        }
        Ok(Self {
            children,
            poll_interval,
            grace,
        })
    }

    pub fn children(&self) -> &[SupervisedChild] {
        &self.children
    }

    /// Polls every child once and logs a liveness line.
    pub fn tick(&mut self) -> Vec<(String, ChildStatus)> {
        let mut report = Vec::with_capacity(self.children.len());
        for child in self.children.iter_mut() {
            match child.poll() {
                Ok(status) => report.push((child.name().to_string(), status)),
                Err(err) => warn!("{}", err),
            }
        }
        let line: Vec<String> = report
            .iter()
            .map(|(name, status)| format!("{}={}", name, status))
            .collect();
        info!("liveness: {}", line.join(", "));
        report
    }

    pub async fn run_until<F: Future<Output = ()>>(&mut self, shutdown: F) {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick();
                }
                _ = &mut shutdown => break,
            }
        }
        self.shutdown().await;
    }

    /// SIGTERM to every live child, one shared grace window, then SIGKILL.
    pub async fn shutdown(&mut self) {
        let mut signalled = 0;
        for child in self.children.iter_mut() {
            if child.terminate() {
                signalled += 1;
            }
        }
        info!(
            "waiting up to {:?} for {} process(es) to stop",
            self.grace, signalled
        );

        let deadline = Instant::now() + self.grace;
        for child in self.children.iter_mut() {
            child.wait_or_kill(deadline).await;
        }
        info!("all supervised processes stopped");
    }
}
