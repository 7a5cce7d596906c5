//! Scoped lease over a party's matching-engine instance.
//!
//! Each party owns its own engine and backing store. [`EngineLease::acquire`]
//! writes the engine config into a private temp dir, starts the store and the
//! engine process; [`EngineLease::release`] stops them. The engine gets SIGTERM
//! and a grace period before it is killed. Start and stop are idempotent, and a lease that is dropped without release stops everything it
//! started.

use log::{info, warn};
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::error::LifecycleError;

/// How long a managed engine may take to exit after SIGTERM.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);
const STOP_POLL: Duration = Duration::from_millis(50);

/// One external command: program plus arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ShellCommand {
    pub fn new(program: impl Into<PathBuf>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn describe(&self) -> String {
        let mut s = self.program.display().to_string();
        for arg in &self.args {
            s.push(' ');
            s.push_str(arg);
        }
        s
    }

    /// Runs to completion; non-zero exit is an error.
    fn run(&self) -> Result<(), LifecycleError> {
        let status = Command::new(&self.program).args(&self.args).status()?;
        if status.success() {
            Ok(())
        } else {
            Err(LifecycleError::CommandFailed {
                command: self.describe(),
                status: status.to_string(),
            })
        }
    }
}

/// Commands controlling the engine's relational store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreControl {
    /// Runs before `start` only when `marker` does not exist yet.
    pub init: Option<(ShellCommand, PathBuf)>,
    pub start: ShellCommand,
    pub stop: ShellCommand,
}

impl StoreControl {
    /// `initdb` / `pg_ctl start -w` / `pg_ctl stop -m fast` for a PostgreSQL data dir.
    pub fn postgres(bin_dir: impl AsRef<Path>, data_dir: impl Into<String>) -> Self {
        let bin_dir = bin_dir.as_ref();
        let data_dir = data_dir.into();
        let marker = Path::new(&data_dir).join("PG_VERSION");
        Self {
            init: Some((
                ShellCommand::new(
                    bin_dir.join("initdb"),
                    &["-D", &data_dir, "--encoding=UTF8", "--locale=en_US.UTF-8"],
                ),
                marker,
            )),
            start: ShellCommand::new(
                bin_dir.join("pg_ctl"),
                &["start", "-D", &data_dir, "-w", "-t", "60"],
            ),
            stop: ShellCommand::new(bin_dir.join("pg_ctl"), &["stop", "-D", &data_dir, "-m", "fast"]),
        }
    }
}

/// How a party gets its engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineProvision {
    /// Engine already running and managed elsewhere; the lease is a no-op.
    External,
    /// The party starts and stops the engine (and optionally its store) itself.
    Managed(ManagedEngine),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagedEngine {
    pub binary: PathBuf,
    pub store: Option<StoreControl>,
    /// Wait after SIGTERM before the engine is killed.
    pub stop_grace: Duration,
}

/// Store started by this lease; stopped at most once.
#[derive(Debug)]
struct RunningStore {
    control: StoreControl,
    running: bool,
}

impl RunningStore {
    fn start(control: &StoreControl) -> Result<Self, LifecycleError> {
        if let Some((init, marker)) = &control.init {
            if marker.exists() {
                info!("store already initialised marker={}", marker.display());
            } else {
                info!("initialising store command={}", init.describe());
                init.run()?;
            }
        }
        info!("starting store command={}", control.start.describe());
        control.start.run()?;
        Ok(Self {
            control: control.clone(),
            running: true,
        })
    }

    fn stop(&mut self) -> Result<(), LifecycleError> {
        if !self.running {
            return Ok(());
        }
        self.running = false;
        info!("stopping store command={}", self.control.stop.describe());
        self.control.stop.run()
    }
}

/// Scoped handle over a party's engine instance.
#[derive(Debug)]
pub struct EngineLease {
    child: Option<Child>,
    store: Option<RunningStore>,
    config_dir: Option<tempfile::TempDir>,
    stop_grace: Duration,
}

impl EngineLease {
    /// Lease that owns nothing (external engine).
    pub fn external() -> Self {
        Self {
            child: None,
            store: None,
            config_dir: None,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    /// Starts the store and engine for `provision` with `config`.
    ///
    /// On failure anything already started is stopped before the error is returned.
    pub fn acquire(provision: &EngineProvision, config: &EngineConfig) -> Result<Self, LifecycleError> {
        let managed = match provision {
            EngineProvision::External => return Ok(Self::external()),
            EngineProvision::Managed(managed) => managed,
        };
        let mut lease = Self::external();
        lease.stop_grace = managed.stop_grace;
        let config_dir = tempfile::tempdir()?;
        let config_path = config.write_toml(config_dir.path())?;
        lease.config_dir = Some(config_dir);
        info!("engine config written path={}", config_path.display());

        if let Some(control) = &managed.store {
            lease.store = Some(RunningStore::start(control)?);
        }
        let child = Command::new(&managed.binary)
            .arg("--config")
            .arg(&config_path)
            .env("CONFIG_PATH", &config_path)
            .current_dir(config_path.parent().unwrap_or(Path::new(".")))
            .spawn();
        match child {
            Ok(child) => {
                info!("engine started binary={} pid={}", managed.binary.display(), child.id());
                lease.child = Some(child);
                Ok(lease)
            }
            Err(e) => {
                warn!("engine start failed binary={} error={}", managed.binary.display(), e);
                let _ = lease.release();
                Err(e.into())
            }
        }
    }

    /// Whether this lease still holds a running engine or store.
    pub fn is_active(&self) -> bool {
        self.child.is_some() || self.store.as_ref().map(|s| s.running).unwrap_or(false)
    }

    /// Path of the engine config written for this lease, if any.
    pub fn config_path(&self) -> Option<PathBuf> {
        self.config_dir.as_ref().map(|d| d.path().join("config.toml"))
    }

    /// Stops the engine, then the store. Safe to call repeatedly.
    pub fn release(&mut self) -> Result<(), LifecycleError> {
        if let Some(mut child) = self.child.take() {
            match child.try_wait() {
                Ok(Some(status)) => info!("engine already exited status={}", status),
                _ => stop_engine(&mut child, self.stop_grace)?,
            }
        }
        match self.store.as_mut() {
            Some(store) => store.stop(),
            None => Ok(()),
        }
    }
}

/// SIGTERM, wait up to `grace` for exit, then kill.
fn stop_engine(child: &mut Child, grace: Duration) -> Result<(), LifecycleError> {
    let pid = child.id();
    info!("stopping engine pid={} grace={:?}", pid, grace);
    if let Err(e) = ShellCommand::new("kill", &["-TERM", &pid.to_string()]).run() {
        warn!("engine terminate failed pid={} error={}", pid, e);
    }
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait()? {
            info!("engine stopped pid={} status={}", pid, status);
            return Ok(());
        }
        std::thread::sleep(STOP_POLL);
    }
    warn!("engine still running after {:?}, killing pid={}", grace, pid);
    if let Err(e) = child.kill() {
        warn!("engine kill failed pid={} error={}", pid, e);
    }
    child.wait()?;
    Ok(())
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        if self.is_active() {
            if let Err(e) = self.release() {
                warn!("engine release on drop failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineDeployment, LinkageSettings};

    fn config() -> EngineConfig {
        EngineConfig::for_coordinator(&LinkageSettings::default(), &EngineDeployment::default())
    }

    #[test]
    fn external_lease_is_inert() {
        let mut lease = EngineLease::acquire(&EngineProvision::External, &config()).unwrap();
        assert!(!lease.is_active());
        assert!(lease.config_path().is_none());
        lease.release().unwrap();
    }

    #[test]
    fn managed_lease_writes_config_and_releases_idempotently() {
        let provision = EngineProvision::Managed(ManagedEngine {
            binary: PathBuf::from("true"),
            store: Some(StoreControl {
                init: None,
                start: ShellCommand::new("true", &[]),
                stop: ShellCommand::new("true", &[]),
            }),
            stop_grace: DEFAULT_STOP_GRACE,
        });
        let mut lease = EngineLease::acquire(&provision, &config()).unwrap();
        assert!(lease.is_active());
        let path = lease.config_path().unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("BloomFilterComparator"));
        lease.release().unwrap();
        assert!(!lease.is_active());
        lease.release().unwrap();
    }

    #[test]
    fn failing_store_start_is_reported() {
        let provision = EngineProvision::Managed(ManagedEngine {
            binary: PathBuf::from("true"),
            store: Some(StoreControl {
                init: None,
                start: ShellCommand::new("false", &[]),
                stop: ShellCommand::new("true", &[]),
            }),
            stop_grace: DEFAULT_STOP_GRACE,
        });
        let err = EngineLease::acquire(&provision, &config()).unwrap_err();
        assert!(matches!(err, LifecycleError::CommandFailed { .. }));
    }

    #[test]
    fn missing_engine_binary_stops_store() {
        let provision = EngineProvision::Managed(ManagedEngine {
            binary: PathBuf::from("/nonexistent/engine-binary"),
            store: Some(StoreControl {
                init: None,
                start: ShellCommand::new("true", &[]),
                stop: ShellCommand::new("true", &[]),
            }),
            stop_grace: DEFAULT_STOP_GRACE,
        });
        let err = EngineLease::acquire(&provision, &config()).unwrap_err();
        assert!(matches!(err, LifecycleError::Io(_)));
    }

    /// Executable shell script standing in for the engine binary.
    fn engine_script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("engine.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn engine_exits_on_terminate_without_waiting_out_the_grace() {
        let dir = tempfile::tempdir().unwrap();
        let provision = EngineProvision::Managed(ManagedEngine {
            binary: engine_script(dir.path(), "exec sleep 30"),
            store: None,
            stop_grace: Duration::from_secs(20),
        });
        let mut lease = EngineLease::acquire(&provision, &config()).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        lease.release().unwrap();
        assert!(!lease.is_active());
        assert!(started.elapsed() < Duration::from_secs(10), "{:?}", started.elapsed());
    }

    #[test]
    fn engine_ignoring_terminate_is_killed_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let provision = EngineProvision::Managed(ManagedEngine {
            binary: engine_script(dir.path(), "trap '' TERM\nexec sleep 30"),
            store: None,
            stop_grace: Duration::from_millis(300),
        });
        let mut lease = EngineLease::acquire(&provision, &config()).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        lease.release().unwrap();
        assert!(!lease.is_active());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(10), "{elapsed:?}");
    }

    #[test]
    fn postgres_control_uses_bin_dir() {
        let control = StoreControl::postgres("/usr/lib/postgresql/14/bin", "/data");
        assert_eq!(control.start.program, PathBuf::from("/usr/lib/postgresql/14/bin/pg_ctl"));
        assert!(control.stop.args.contains(&"fast".to_string()));
        let (init, marker) = control.init.unwrap();
        assert!(init.program.ends_with("initdb"));
        assert_eq!(marker, PathBuf::from("/data/PG_VERSION"));
    }
}
