//! Broker Supervisor
//!
//! Owns the broker child process: binary resolution, config generation,
//! adoption of an already-running instance, launch and teardown.

use std::ffi::OsStr;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::api::BrokerClient;
use crate::broker_config::BrokerYaml;
use crate::control::BrokerControl;
use crate::procfs::{remove_path, ProcFs};

/// Positive readiness answers are trusted for this long.
const READY_CACHE_TTL: Duration = Duration::from_secs(5);
const DEATH_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("broker binary not found: {0}")]
    BinaryNotFound(String),

    #[error("port {0} is in use by another process")]
    PortInUse(u16),

    #[error("failed to spawn broker: {0}")]
    Spawn(std::io::Error),

    #[error("broker exited during startup (status {0:?})")]
    ExitedEarly(Option<i32>),

    #[error("broker API not ready after {attempts} attempts")]
    NotReady { attempts: u32 },

    #[error("broker processes survived termination: {0:?}")]
    StillRunning(Vec<i32>),

    #[error("failed to write broker config: {0}")]
    Config(std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SupervisorError> for nvr_core::Error {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::BinaryNotFound(_) | SupervisorError::Spawn(_) | SupervisorError::Config(_) => {
                Self::Fatal(err.to_string())
            }
            SupervisorError::PortInUse(_) | SupervisorError::StillRunning(_) => Self::Contention(err.to_string()),
            SupervisorError::ExitedEarly(_) | SupervisorError::NotReady { .. } => Self::BrokerDeath(err.to_string()),
            SupervisorError::Io(e) => Self::Io(e),
        }
    }
}

/// Startup and teardown pacing.
#[derive(Debug, Clone)]
pub struct SupervisorTimings {
    /// Pause after spawn before checking the child is still alive.
    pub settle: Duration,
    pub api_attempts: u32,
    pub api_interval: Duration,
    pub port_attempts: u32,
    /// Grace period per PID between SIGTERM and SIGKILL.
    pub term_wait: Duration,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(1),
            api_attempts: 10,
            api_interval: Duration::from_secs(1),
            port_attempts: 10,
            term_wait: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub binary_path: Option<PathBuf>,
    pub config_dir: PathBuf,
    /// argv[0] of the child and the name matched by process scans.
    pub broker_name: String,
    pub api_port: u16,
    pub rtsp_port: u16,
    /// The child's stdout/stderr go to `<log_dir>/<broker_name>.log`.
    pub log_dir: PathBuf,
    /// Leftovers of other supervisors (s6 config copies, log dirs) removed on stop.
    pub scratch_paths: Vec<PathBuf>,
    pub yaml: BrokerYaml,
    pub timings: SupervisorTimings,
}

impl SupervisorOptions {
    #[must_use]
    pub fn from_config(config: &nvr_core::Config) -> Self {
        Self {
            binary_path: config
                .broker
                .binary_path
                .as_deref()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
            config_dir: PathBuf::from(&config.broker.config_dir),
            broker_name: config.broker.name.clone(),
            api_port: config.broker.api_port,
            rtsp_port: config.broker.rtsp_port,
            log_dir: config.log_dir(),
            scratch_paths: config.broker.scratch_paths.iter().map(PathBuf::from).collect(),
            yaml: BrokerYaml::from_config(&config.broker, &config.webrtc),
            timings: SupervisorTimings::default(),
        }
    }

    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(format!("{}.yaml", self.broker_name))
    }

    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.log_dir.join(format!("{}.log", self.broker_name))
    }
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

/// Explicit path when executable, else the first executable `name` on `path_env`.
#[must_use]
pub fn resolve_binary(explicit: Option<&Path>, name: &str, path_env: Option<&OsStr>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return is_executable(path).then(|| path.to_path_buf());
    }
    std::env::split_paths(path_env?)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

/// SIGTERM each PID, wait up to `term_wait` per PID, then SIGKILL and
/// `killpg` whatever is left. Returns the PIDs still alive afterwards.
pub async fn terminate_processes(procfs: &ProcFs, pids: &[i32], term_wait: Duration) -> Vec<i32> {
    for &pid in pids {
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            debug!(pid, error = %e, "SIGTERM failed");
        }
    }

    let mut survivors = Vec::new();
    for &pid in pids {
        if !wait_for_exit(procfs, pid, term_wait).await {
            survivors.push(pid);
        }
    }
    if survivors.is_empty() {
        return survivors;
    }

    for &pid in &survivors {
        warn!(pid, "Broker process ignored SIGTERM, sending SIGKILL");
        let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        // Children are started as their own group leaders.
        let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
    }

    let mut remaining = Vec::new();
    for pid in survivors {
        if !wait_for_exit(procfs, pid, Duration::from_secs(1)).await {
            remaining.push(pid);
        }
    }
    remaining
}

/// Poll until `pid` is gone or a zombie, reaping it when it is our child.
async fn wait_for_exit(procfs: &ProcFs, pid: i32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let _ = waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG));
        if procfs.is_dead(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(DEATH_POLL_INTERVAL).await;
    }
}

#[derive(Default)]
struct ProcessState {
    child: Option<Child>,
    /// Tracked PID; may belong to an untracked broker found by a scan.
    pid: Option<i32>,
    /// Running before we started; never stopped by us.
    adopted: bool,
}

pub struct BrokerSupervisor {
    options: SupervisorOptions,
    client: Arc<BrokerClient>,
    procfs: ProcFs,
    binary: Option<PathBuf>,
    state: Mutex<ProcessState>,
    rtsp_port: AtomicU16,
    ready_at: parking_lot::Mutex<Option<Instant>>,
}

impl BrokerSupervisor {
    /// Prepare the config directory and file, and detect an instance to adopt.
    ///
    /// Fails when no broker is answering and no binary can be resolved.
    pub async fn init(options: SupervisorOptions, client: Arc<BrokerClient>) -> Result<Self, SupervisorError> {
        Self::init_with_procfs(options, client, ProcFs::default()).await
    }

    pub async fn init_with_procfs(
        options: SupervisorOptions,
        client: Arc<BrokerClient>,
        procfs: ProcFs,
    ) -> Result<Self, SupervisorError> {
        if !options.config_dir.exists() {
            std::fs::create_dir_all(&options.config_dir)?;
            std::fs::set_permissions(&options.config_dir, std::fs::Permissions::from_mode(0o755))?;
        }
        let config_path = options.config_path();
        options.yaml.write_to(&config_path).map_err(SupervisorError::Config)?;
        info!(path = %config_path.display(), "Wrote broker config");

        let adopted = client.is_api_ready().await;
        let binary = if adopted {
            info!(port = options.api_port, "Broker already answering, adopting existing instance");
            None
        } else {
            let path_env = std::env::var_os("PATH");
            let binary = resolve_binary(options.binary_path.as_deref(), &options.broker_name, path_env.as_deref())
                .ok_or_else(|| {
                    SupervisorError::BinaryNotFound(
                        options
                            .binary_path
                            .as_ref()
                            .map_or_else(|| options.broker_name.clone(), |p| p.display().to_string()),
                    )
                })?;
            info!(binary = %binary.display(), "Resolved broker binary");
            Some(binary)
        };

        Ok(Self {
            rtsp_port: AtomicU16::new(options.rtsp_port),
            options,
            client,
            procfs,
            binary,
            state: Mutex::new(ProcessState {
                adopted,
                ..ProcessState::default()
            }),
            ready_at: parking_lot::Mutex::new(None),
        })
    }

    #[must_use]
    pub fn client(&self) -> &Arc<BrokerClient> {
        &self.client
    }

    #[must_use]
    pub const fn options(&self) -> &SupervisorOptions {
        &self.options
    }

    pub async fn is_adopted(&self) -> bool {
        self.state.lock().await.adopted
    }

    pub async fn pid(&self) -> Option<i32> {
        self.state.lock().await.pid
    }

    #[must_use]
    pub fn rtsp_port(&self) -> u16 {
        self.rtsp_port.load(Ordering::Relaxed)
    }

    /// Start the broker, or adopt one already answering on the API port.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let mut state = self.state.lock().await;

        if self.client.is_api_ready().await {
            if state.child.is_none() && !state.adopted {
                info!(port = self.options.api_port, "Broker API already answering, adopting");
                state.adopted = true;
            }
            self.mark_ready();
            return Ok(());
        }

        // A broker that stopped answering cannot be adopted any more.
        state.adopted = false;

        let strays = self.procfs.find_processes(&self.options.broker_name)?;
        if !strays.is_empty() {
            warn!(pids = ?strays, "Unresponsive broker processes found, terminating");
            let survivors = terminate_processes(&self.procfs, &strays, self.options.timings.term_wait).await;
            if !survivors.is_empty() {
                return Err(SupervisorError::StillRunning(survivors));
            }
        }

        if self.procfs.port_listening(self.options.api_port) {
            error!(port = self.options.api_port, "Broker API port held by a non-broker process");
            return Err(SupervisorError::PortInUse(self.options.api_port));
        }

        let binary = self
            .binary
            .clone()
            .ok_or_else(|| SupervisorError::BinaryNotFound(self.options.broker_name.clone()))?;

        let child = self.spawn(&binary)?;
        let pid = child.id().and_then(|id| i32::try_from(id).ok());
        info!(pid = ?pid, binary = %binary.display(), "Launched broker");
        state.child = Some(child);
        state.pid = pid;

        match self.await_startup(&mut state).await {
            Ok(()) => {
                self.mark_ready();
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Broker failed to start");
                self.kill_tracked(&mut state).await;
                Err(e)
            }
        }
    }

    fn spawn(&self, binary: &Path) -> Result<Child, SupervisorError> {
        std::fs::create_dir_all(&self.options.log_dir)?;
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o644)
            .open(self.options.log_path())?;
        let log_err = log.try_clone()?;

        let mut command = Command::new(binary);
        command
            .arg0(&self.options.broker_name)
            .arg("--config")
            .arg(self.options.config_path())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0)
            .kill_on_drop(false);

        let parent = nix::unistd::getpid();
        // SAFETY: the closure only calls async-signal-safe prctl/getppid.
        #[allow(unsafe_code)]
        unsafe {
            command.pre_exec(move || {
                nix::sys::prctl::set_pdeathsig(Signal::SIGTERM)?;
                if nix::unistd::getppid() != parent {
                    return Err(std::io::Error::other("supervisor exited before exec"));
                }
                Ok(())
            });
        }

        command.spawn().map_err(SupervisorError::Spawn)
    }

    async fn await_startup(&self, state: &mut ProcessState) -> Result<(), SupervisorError> {
        let timings = &self.options.timings;
        tokio::time::sleep(timings.settle).await;

        if let Some(child) = state.child.as_mut() {
            if let Some(status) = child.try_wait()? {
                state.child = None;
                state.pid = None;
                return Err(SupervisorError::ExitedEarly(status.code()));
            }
        }

        let mut ready = false;
        for attempt in 1..=timings.api_attempts {
            if self.client.is_api_ready().await {
                ready = true;
                break;
            }
            debug!(attempt, "Waiting for broker API");
            if let Some(child) = state.child.as_mut() {
                if let Some(status) = child.try_wait()? {
                    state.child = None;
                    state.pid = None;
                    return Err(SupervisorError::ExitedEarly(status.code()));
                }
            }
            tokio::time::sleep(timings.api_interval).await;
        }
        if !ready {
            return Err(SupervisorError::NotReady {
                attempts: timings.api_attempts,
            });
        }

        for _ in 0..timings.port_attempts {
            match self.client.get_server_info().await {
                Ok(info) => {
                    if let Some(port) = info.rtsp_port() {
                        self.rtsp_port.store(port, Ordering::Relaxed);
                        info!(rtsp_port = port, "Broker ready");
                        return Ok(());
                    }
                    break;
                }
                Err(e) => debug!(error = %e, "Server info not available yet"),
            }
            tokio::time::sleep(timings.api_interval).await;
        }
        warn!(rtsp_port = self.rtsp_port(), "Could not read RTSP port from broker, using configured port");
        Ok(())
    }

    async fn kill_tracked(&self, state: &mut ProcessState) {
        if let Some(pid) = state.pid.take() {
            let survivors = terminate_processes(&self.procfs, &[pid], self.options.timings.term_wait).await;
            if !survivors.is_empty() {
                error!(pid, "Broker child survived SIGKILL");
            }
        }
        if let Some(mut child) = state.child.take() {
            let _ = child.try_wait();
        }
    }

    /// Stop the broker and clean up after it. Adopted instances are left running.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let mut state = self.state.lock().await;
        self.invalidate_ready();

        if state.adopted {
            info!("Broker was adopted, leaving it running");
            return Ok(());
        }

        let mut pids: Vec<i32> = state.pid.into_iter().collect();
        for pid in self.procfs.find_processes(&self.options.broker_name)? {
            if !pids.contains(&pid) {
                pids.push(pid);
            }
        }

        let survivors = if pids.is_empty() {
            Vec::new()
        } else {
            info!(pids = ?pids, "Stopping broker");
            terminate_processes(&self.procfs, &pids, self.options.timings.term_wait).await
        };
        if let Some(mut child) = state.child.take() {
            let _ = child.try_wait();
        }
        state.pid = None;

        // Final sweep for anything respawned meanwhile.
        let mut remaining = survivors;
        for pid in self.procfs.find_processes(&self.options.broker_name)? {
            if !remaining.contains(&pid) {
                remaining.push(pid);
            }
        }

        for path in &self.options.scratch_paths {
            if let Err(e) = remove_path(path) {
                warn!(path = %path.display(), error = %e, "Failed to remove broker scratch path");
            }
        }

        if self.procfs.port_listening(self.options.api_port) {
            warn!(port = self.options.api_port, "Broker API port still listening after stop");
        }

        if remaining.is_empty() {
            info!("Broker stopped");
            Ok(())
        } else {
            error!(pids = ?remaining, "Some broker processes could not be stopped");
            Err(SupervisorError::StillRunning(remaining))
        }
    }

    /// Whether a broker is running: the API for adopted instances, otherwise
    /// the tracked child, otherwise a `/proc` scan (which re-adopts its PID).
    pub async fn is_running(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.adopted {
            return self.client.is_api_ready().await;
        }

        if let Some(pid) = state.pid {
            let child_exited = match state.child.as_mut() {
                Some(child) => matches!(child.try_wait(), Ok(Some(_))),
                None => false,
            };
            if !child_exited
                && !self.procfs.is_dead(pid)
                && self.procfs.process_matches(pid, &self.options.broker_name)
            {
                return true;
            }
            info!(pid, "Tracked broker process is gone");
            state.child = None;
            state.pid = None;
        }

        match self.procfs.find_processes(&self.options.broker_name) {
            Ok(pids) => match pids.first() {
                Some(&pid) => {
                    warn!(pid, "Found untracked broker process, tracking it");
                    state.pid = Some(pid);
                    true
                }
                None => false,
            },
            Err(e) => {
                warn!(error = %e, "Process scan failed");
                false
            }
        }
    }

    fn mark_ready(&self) {
        *self.ready_at.lock() = Some(Instant::now());
    }

    fn invalidate_ready(&self) {
        *self.ready_at.lock() = None;
        self.client.invalidate_cache();
    }
}

#[async_trait]
impl BrokerControl for BrokerSupervisor {
    async fn is_ready(&self) -> bool {
        if self.ready_at.lock().is_some_and(|at| at.elapsed() < READY_CACHE_TTL) {
            return true;
        }
        let ready = self.client.is_api_ready().await;
        if ready {
            self.mark_ready();
        }
        ready
    }

    async fn start_service(&self) -> Result<(), SupervisorError> {
        self.start().await
    }

    async fn stop_service(&self) -> Result<(), SupervisorError> {
        self.stop().await
    }

    fn invalidate_ready_cache(&self) {
        self.invalidate_ready();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvr_core::config::{BrokerConfig, WebRtcConfig};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn options(dir: &Path, binary: Option<PathBuf>) -> SupervisorOptions {
        SupervisorOptions {
            binary_path: binary,
            config_dir: dir.join("broker"),
            broker_name: "nvr-test-broker".to_string(),
            api_port: 1984,
            rtsp_port: 8554,
            log_dir: dir.join("logs"),
            scratch_paths: vec![dir.join("scratch")],
            yaml: BrokerYaml::from_config(&BrokerConfig::default(), &WebRtcConfig::default()),
            timings: SupervisorTimings {
                settle: Duration::from_millis(200),
                api_attempts: 2,
                api_interval: Duration::from_millis(50),
                port_attempts: 1,
                term_wait: Duration::from_secs(2),
            },
        }
    }

    fn unreachable_client() -> Arc<BrokerClient> {
        Arc::new(BrokerClient::with_base_url("http://127.0.0.1:9", 9, "", 8554).unwrap())
    }

    fn empty_proc(dir: &Path) -> ProcFs {
        let root = dir.join("proc");
        std::fs::create_dir_all(root.join("net")).unwrap();
        ProcFs::new(root)
    }

    #[test]
    fn test_resolve_binary() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("go2rtc");
        std::fs::write(&bin, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        let plain = dir.path().join("plain");
        std::fs::write(&plain, "").unwrap();

        assert_eq!(resolve_binary(Some(&bin), "ignored", None), Some(bin.clone()));
        assert_eq!(resolve_binary(Some(&plain), "plain", Some(dir.path().as_os_str())), None);

        let path_env = std::env::join_paths([Path::new("/nonexistent"), dir.path()]).unwrap();
        assert_eq!(resolve_binary(None, "go2rtc", Some(&path_env)), Some(bin));
        assert_eq!(resolve_binary(None, "plain", Some(&path_env)), None);
        assert_eq!(resolve_binary(None, "go2rtc", None), None);
    }

    #[tokio::test]
    async fn test_init_writes_private_config() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path(), Some(PathBuf::from("/bin/sleep")));
        let config_path = opts.config_path();
        let supervisor = BrokerSupervisor::init_with_procfs(opts, unreachable_client(), empty_proc(dir.path()))
            .await
            .unwrap();

        assert!(!supervisor.is_adopted().await);
        let mode = std::fs::metadata(&config_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert!(config_path.ends_with("broker/nvr-test-broker.yaml"));
    }

    #[tokio::test]
    async fn test_init_without_binary_fails() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path(), Some(dir.path().join("missing")));
        let result = BrokerSupervisor::init_with_procfs(opts, unreachable_client(), empty_proc(dir.path())).await;
        assert!(matches!(result, Err(SupervisorError::BinaryNotFound(_))));
    }

    #[tokio::test]
    async fn test_adopts_running_broker_and_leaves_it_on_stop() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/streams"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("scratch")).unwrap();
        let client = Arc::new(BrokerClient::with_base_url(server.uri(), 1984, "", 8554).unwrap());
        let supervisor = BrokerSupervisor::init_with_procfs(options(dir.path(), None), client, empty_proc(dir.path()))
            .await
            .unwrap();

        assert!(supervisor.is_adopted().await);
        supervisor.start().await.unwrap();
        assert!(supervisor.is_running().await);
        assert!(supervisor.is_ready().await);

        supervisor.stop().await.unwrap();
        assert!(supervisor.is_adopted().await);
        assert!(supervisor.pid().await.is_none());
        // Adopted instances are not cleaned up after.
        assert!(dir.path().join("scratch").exists());
    }

    #[tokio::test]
    async fn test_child_exiting_during_startup_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        // sleep rejects --config and exits at once.
        let supervisor = BrokerSupervisor::init_with_procfs(
            options(dir.path(), Some(PathBuf::from("/bin/sleep"))),
            unreachable_client(),
            empty_proc(dir.path()),
        )
        .await
        .unwrap();

        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::ExitedEarly(_)), "{err}");
        assert!(supervisor.pid().await.is_none());
        assert!(dir.path().join("logs/nvr-test-broker.log").exists());
    }

    #[tokio::test]
    async fn test_port_held_by_other_process() {
        let dir = tempfile::tempdir().unwrap();
        let procfs = empty_proc(dir.path());
        std::fs::write(
            procfs.root().join("net/tcp"),
            "header\n   0: 00000000:07C0 00000000:0000 0A 0 0 0\n",
        )
        .unwrap();

        let supervisor = BrokerSupervisor::init_with_procfs(
            options(dir.path(), Some(PathBuf::from("/bin/sleep"))),
            unreachable_client(),
            procfs,
        )
        .await
        .unwrap();
        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::PortInUse(1984)));
    }

    #[tokio::test]
    async fn test_stop_removes_scratch_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("scratch/nested")).unwrap();
        let supervisor = BrokerSupervisor::init_with_procfs(
            options(dir.path(), Some(PathBuf::from("/bin/sleep"))),
            unreachable_client(),
            empty_proc(dir.path()),
        )
        .await
        .unwrap();

        supervisor.stop().await.unwrap();
        assert!(!dir.path().join("scratch").exists());
        assert!(!supervisor.is_running().await);
    }

    #[tokio::test]
    async fn test_terminate_processes_kills_and_reaps() {
        let child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id() as i32;

        let survivors = terminate_processes(&ProcFs::default(), &[pid], Duration::from_secs(3)).await;
        assert!(survivors.is_empty());
        assert!(ProcFs::default().is_dead(pid));
    }
}
