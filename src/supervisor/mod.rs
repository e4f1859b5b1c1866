//! Process Supervisor
//!
//! ## Responsibilities
//!
//! - Start, stop, restart and probe per-camera worker processes
//! - Persist PID records under `{pid_dir}/{camera_id}.pid` so liveness
//!   survives a server restart
//! - Redirect worker stdout/stderr to `{log_dir}/{camera_id}.log` (append)
//!
//! Workers are plain OS processes; the supervisor holds no channels to them
//! and no in-memory handle beyond the PID record. Every operator-facing
//! operation returns a structured [`OpOutcome`] instead of failing, so the
//! web surface serializes results directly.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, System};

/// How a worker for one camera is to be run
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub camera_id: String,
    /// Capture source (device index, file path, or stream URL)
    pub source: String,
    /// Detection profile name forwarded to the worker
    pub profile: Option<String>,
    /// Device hint (e.g. a specific /dev/video node)
    pub device: Option<String>,
    /// Process every Nth frame
    pub process_every: Option<u32>,
    /// Inactive cameras are refused, not spawned
    pub active: bool,
}

/// Who may run and how. The supervisor never invents workers; it only
/// materializes what the directory describes.
pub trait WorkerDirectory: Send + Sync {
    fn spec(&self, camera_id: &str) -> Option<WorkerSpec>;
    fn all(&self) -> Vec<WorkerSpec>;
}

/// Directory backed by a plain map, loaded at startup
#[derive(Default)]
pub struct InMemoryDirectory {
    entries: std::sync::RwLock<std::collections::HashMap<String, WorkerSpec>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, spec: WorkerSpec) {
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.insert(spec.camera_id.clone(), spec);
    }
}

impl WorkerDirectory for InMemoryDirectory {
    fn spec(&self, camera_id: &str) -> Option<WorkerSpec> {
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.get(camera_id).cloned()
    }

    fn all(&self) -> Vec<WorkerSpec> {
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut all: Vec<_> = entries.values().cloned().collect();
        all.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));
        all
    }
}

/// Result of one supervisor operation, serialized as-is by the web surface
#[derive(Debug, Clone, Serialize)]
pub struct OpOutcome {
    pub camera_id: String,
    pub ok: bool,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl OpOutcome {
    fn running(camera_id: &str, pid: u32) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            ok: true,
            running: true,
            pid: Some(pid),
            reason: None,
        }
    }

    fn stopped(camera_id: &str, reason: impl Into<String>) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            ok: true,
            running: false,
            pid: None,
            reason: Some(reason.into()),
        }
    }

    fn refused(camera_id: &str, reason: impl Into<String>) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            ok: false,
            running: false,
            pid: None,
            reason: Some(reason.into()),
        }
    }
}

/// Supervisor wiring, fixed at startup
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub pid_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Worker executable to spawn
    pub worker_program: PathBuf,
    pub channel_url: String,
    pub detector_url: Option<String>,
    /// SIGTERM-to-SIGKILL escalation window
    pub grace_period: Duration,
    /// Pause between stop and start on restart
    pub restart_settle: Duration,
}

impl SupervisorConfig {
    pub fn new(pid_dir: PathBuf, log_dir: PathBuf, worker_program: PathBuf, channel_url: String) -> Self {
        Self {
            pid_dir,
            log_dir,
            worker_program,
            channel_url,
            detector_url: None,
            grace_period: Duration::from_secs(5),
            restart_settle: Duration::from_millis(500),
        }
    }
}

pub struct ProcessSupervisor {
    config: SupervisorConfig,
    directory: Arc<dyn WorkerDirectory>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig, directory: Arc<dyn WorkerDirectory>) -> Self {
        Self { config, directory }
    }

    /// Start the worker for a camera.
    ///
    /// Idempotent: a live PID record returns the existing worker instead of
    /// spawning a second process. A stale record (dead PID, or a reused PID
    /// now owned by a foreign process) is cleaned up before spawning.
    pub async fn start(&self, camera_id: &str) -> OpOutcome {
        // Idempotence first: a live worker is returned as-is even if the
        // camera was deactivated after it started
        if let Some(pid) = self.read_pid(camera_id).await {
            if self.pid_matches_worker(pid) {
                tracing::info!(camera_id = %camera_id, pid = pid, "Worker already running");
                return OpOutcome::running(camera_id, pid);
            }
            tracing::warn!(camera_id = %camera_id, pid = pid, "Removing stale PID record");
            self.remove_pid(camera_id).await;
        }

        let Some(spec) = self.directory.spec(camera_id) else {
            return OpOutcome::refused(camera_id, "unknown camera");
        };
        if !spec.active {
            return OpOutcome::refused(camera_id, "camera is inactive");
        }

        if let Err(e) = tokio::fs::create_dir_all(&self.config.pid_dir).await {
            return OpOutcome::refused(camera_id, format!("pid dir unavailable: {}", e));
        }
        if let Err(e) = tokio::fs::create_dir_all(&self.config.log_dir).await {
            return OpOutcome::refused(camera_id, format!("log dir unavailable: {}", e));
        }

        let log_path = self.config.log_dir.join(format!("{}.log", camera_id));
        let log_file = match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
        {
            Ok(f) => f,
            Err(e) => return OpOutcome::refused(camera_id, format!("log file unavailable: {}", e)),
        };
        let log_err = match log_file.try_clone() {
            Ok(f) => f,
            Err(e) => return OpOutcome::refused(camera_id, format!("log file unavailable: {}", e)),
        };

        let mut command = tokio::process::Command::new(&self.config.worker_program);
        command
            .env("CAMWATCH_CAMERA_ID", &spec.camera_id)
            .env("CAMWATCH_SOURCE", &spec.source)
            .env("CAMWATCH_CHANNEL_URL", &self.config.channel_url)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::from(log_file))
            .stderr(std::process::Stdio::from(log_err));
        if let Some(profile) = &spec.profile {
            command.env("CAMWATCH_PROFILE", profile);
        }
        if let Some(device) = &spec.device {
            command.env("CAMWATCH_DEVICE", device);
        }
        if let Some(every) = spec.process_every {
            command.env("CAMWATCH_PROCESS_EVERY", every.to_string());
        }
        if let Some(url) = &self.config.detector_url {
            command.env("CAMWATCH_DETECTOR_URL", url);
        }

        let child = match command.spawn() {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(camera_id = %camera_id, error = %e, "Worker spawn failed");
                return OpOutcome::refused(camera_id, format!("spawn failed: {}", e));
            }
        };
        let Some(pid) = child.id() else {
            return OpOutcome::refused(camera_id, "spawned worker exited immediately");
        };

        if let Err(e) = self.write_pid(camera_id, pid).await {
            tracing::error!(camera_id = %camera_id, error = %e, "PID record write failed");
        }

        tracing::info!(
            camera_id = %camera_id,
            pid = pid,
            source = %spec.source,
            "Worker started"
        );
        OpOutcome::running(camera_id, pid)
    }

    /// Stop the worker for a camera. No record is a success no-op. The PID
    /// record is removed whether or not the process needed killing.
    pub async fn stop(&self, camera_id: &str) -> OpOutcome {
        let Some(pid) = self.read_pid(camera_id).await else {
            return OpOutcome::stopped(camera_id, "no worker record");
        };

        if !self.pid_matches_worker(pid) {
            self.remove_pid(camera_id).await;
            return OpOutcome::stopped(camera_id, "stale record removed");
        }

        let target = nix::unistd::Pid::from_raw(pid as i32);
        if let Err(e) = nix::sys::signal::kill(target, nix::sys::signal::Signal::SIGTERM) {
            tracing::warn!(camera_id = %camera_id, pid = pid, error = %e, "SIGTERM failed");
        }

        // Poll for a graceful exit, then escalate
        let deadline = tokio::time::Instant::now() + self.config.grace_period;
        let mut graceful = false;
        while tokio::time::Instant::now() < deadline {
            if !self.pid_matches_worker(pid) {
                graceful = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        if !graceful {
            tracing::warn!(camera_id = %camera_id, pid = pid, "Grace period expired, sending SIGKILL");
            if let Err(e) = nix::sys::signal::kill(target, nix::sys::signal::Signal::SIGKILL) {
                tracing::warn!(camera_id = %camera_id, pid = pid, error = %e, "SIGKILL failed");
            }
        }

        self.remove_pid(camera_id).await;
        tracing::info!(camera_id = %camera_id, pid = pid, graceful = graceful, "Worker stopped");
        OpOutcome::stopped(camera_id, if graceful { "terminated" } else { "killed" })
    }

    pub async fn restart(&self, camera_id: &str) -> OpOutcome {
        let stopped = self.stop(camera_id).await;
        if !stopped.ok {
            return stopped;
        }
        tokio::time::sleep(self.config.restart_settle).await;
        self.start(camera_id).await
    }

    /// Probe liveness without side effects. A PID record whose process is
    /// gone, or now belongs to a foreign process, reports not running.
    pub async fn status(&self, camera_id: &str) -> OpOutcome {
        match self.read_pid(camera_id).await {
            Some(pid) if self.pid_matches_worker(pid) => OpOutcome::running(camera_id, pid),
            Some(_) => OpOutcome::stopped(camera_id, "stale record"),
            None => OpOutcome::stopped(camera_id, "no worker record"),
        }
    }

    /// Status for the given cameras, or for every directory entry
    pub async fn batch_status(&self, camera_ids: Option<Vec<String>>) -> Vec<OpOutcome> {
        let ids = match camera_ids {
            Some(ids) => ids,
            None => self.directory.all().into_iter().map(|s| s.camera_id).collect(),
        };
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.status(&id).await);
        }
        out
    }

    fn pid_path(&self, camera_id: &str) -> PathBuf {
        self.config.pid_dir.join(format!("{}.pid", camera_id))
    }

    async fn read_pid(&self, camera_id: &str) -> Option<u32> {
        let raw = tokio::fs::read_to_string(self.pid_path(camera_id)).await.ok()?;
        raw.trim().parse().ok()
    }

    async fn write_pid(&self, camera_id: &str, pid: u32) -> std::io::Result<()> {
        tokio::fs::write(self.pid_path(camera_id), pid.to_string()).await
    }

    async fn remove_pid(&self, camera_id: &str) {
        let _ = tokio::fs::remove_file(self.pid_path(camera_id)).await;
    }

    /// PID liveness plus identity: the command line must mention the worker
    /// program, so a reused PID is never mistaken for our worker.
    fn pid_matches_worker(&self, pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        if !system.refresh_process(pid) {
            return false;
        }
        let Some(process) = system.process(pid) else {
            return false;
        };
        let needle = worker_needle(&self.config.worker_program);
        if needle.is_empty() {
            return false;
        }
        process.cmd().iter().any(|arg| arg.contains(needle)) || process.name().contains(needle)
    }
}

fn worker_needle(program: &Path) -> &str {
    program.file_name().and_then(|n| n.to_str()).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn fake_worker(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("fake-worker.sh");
        std::fs::write(&path, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn supervisor(dir: &TempDir) -> (ProcessSupervisor, Arc<InMemoryDirectory>) {
        let directory = Arc::new(InMemoryDirectory::new());
        directory.insert(WorkerSpec {
            camera_id: "cam1".to_string(),
            source: "0".to_string(),
            profile: None,
            device: None,
            process_every: Some(3),
            active: true,
        });
        directory.insert(WorkerSpec {
            camera_id: "cam2".to_string(),
            source: "1".to_string(),
            profile: None,
            device: None,
            process_every: None,
            active: false,
        });

        let mut config = SupervisorConfig::new(
            dir.path().join("pid"),
            dir.path().join("log"),
            fake_worker(dir),
            "redis://127.0.0.1/".to_string(),
        );
        config.grace_period = Duration::from_secs(2);
        config.restart_settle = Duration::from_millis(50);
        (ProcessSupervisor::new(config, directory.clone()), directory)
    }

    #[tokio::test]
    async fn test_start_refuses_unknown_camera() {
        let dir = TempDir::new().unwrap();
        let (sup, _directory) = supervisor(&dir);
        let outcome = sup.start("ghost").await;
        assert!(!outcome.ok);
        assert!(!outcome.running);
        assert_eq!(outcome.reason.as_deref(), Some("unknown camera"));
    }

    #[tokio::test]
    async fn test_start_refuses_inactive_camera() {
        let dir = TempDir::new().unwrap();
        let (sup, _directory) = supervisor(&dir);
        let outcome = sup.start("cam2").await;
        assert!(!outcome.ok);
        assert_eq!(outcome.reason.as_deref(), Some("camera is inactive"));
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (sup, _directory) = supervisor(&dir);

        let first = sup.start("cam1").await;
        assert!(first.ok && first.running);
        let pid = first.pid.unwrap();
        assert!(dir.path().join("pid/cam1.pid").exists());

        // Second start returns the existing worker, no double-spawn
        let second = sup.start("cam1").await;
        assert_eq!(second.pid, Some(pid));

        sup.stop("cam1").await;
    }

    #[tokio::test]
    async fn test_start_returns_live_worker_despite_deactivation() {
        let dir = TempDir::new().unwrap();
        let (sup, directory) = supervisor(&dir);

        let first = sup.start("cam1").await;
        assert!(first.ok && first.running);

        // Deactivating the camera does not retroactively refuse the worker
        // that is already running; start stays idempotent
        directory.insert(WorkerSpec {
            camera_id: "cam1".to_string(),
            source: "0".to_string(),
            profile: None,
            device: None,
            process_every: Some(3),
            active: false,
        });
        let second = sup.start("cam1").await;
        assert!(second.ok && second.running);
        assert_eq!(second.pid, first.pid);

        sup.stop("cam1").await;
    }

    #[tokio::test]
    async fn test_stop_terminates_and_removes_record() {
        let dir = TempDir::new().unwrap();
        let (sup, _directory) = supervisor(&dir);

        sup.start("cam1").await;
        let outcome = sup.stop("cam1").await;
        assert!(outcome.ok);
        assert!(!outcome.running);
        assert!(!dir.path().join("pid/cam1.pid").exists());

        let status = sup.status("cam1").await;
        assert!(!status.running);
    }

    #[tokio::test]
    async fn test_stop_without_record_is_noop() {
        let dir = TempDir::new().unwrap();
        let (sup, _directory) = supervisor(&dir);
        let outcome = sup.stop("cam1").await;
        assert!(outcome.ok);
        assert!(!outcome.running);
        assert_eq!(outcome.reason.as_deref(), Some("no worker record"));
    }

    #[tokio::test]
    async fn test_status_reports_stale_record_for_foreign_pid() {
        let dir = TempDir::new().unwrap();
        let (sup, _directory) = supervisor(&dir);

        // PID 1 is alive but certainly not our worker
        std::fs::create_dir_all(dir.path().join("pid")).unwrap();
        std::fs::write(dir.path().join("pid/cam1.pid"), "1").unwrap();

        let status = sup.status("cam1").await;
        assert!(status.ok);
        assert!(!status.running);
        assert_eq!(status.reason.as_deref(), Some("stale record"));
        // Side-effect free: the record is still there
        assert!(dir.path().join("pid/cam1.pid").exists());
    }

    #[tokio::test]
    async fn test_start_replaces_stale_record() {
        let dir = TempDir::new().unwrap();
        let (sup, _directory) = supervisor(&dir);

        std::fs::create_dir_all(dir.path().join("pid")).unwrap();
        std::fs::write(dir.path().join("pid/cam1.pid"), "1").unwrap();

        let outcome = sup.start("cam1").await;
        assert!(outcome.ok && outcome.running);
        assert_ne!(outcome.pid, Some(1));

        sup.stop("cam1").await;
    }

    #[tokio::test]
    async fn test_restart_yields_new_pid() {
        let dir = TempDir::new().unwrap();
        let (sup, _directory) = supervisor(&dir);

        let first = sup.start("cam1").await;
        let restarted = sup.restart("cam1").await;
        assert!(restarted.ok && restarted.running);
        assert_ne!(restarted.pid, first.pid);

        sup.stop("cam1").await;
    }

    #[tokio::test]
    async fn test_batch_status_covers_directory() {
        let dir = TempDir::new().unwrap();
        let (sup, _directory) = supervisor(&dir);
        let all = sup.batch_status(None).await;
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|o| !o.running));
        assert_eq!(all[0].camera_id, "cam1");
    }
}
