//! Per-VM lifecycle: overlay + key + seed assembly, hypervisor supervision,
//! readiness probing, remote command execution, teardown.
//!
//! A [`VmRunner`] owns exactly one guest.  `boot` is all-or-nothing —
//! partial state is torn down on failure — and `shutdown` is idempotent
//! and infallible.  Released runners are never rebooted; isolation comes
//! from throwing the whole thing away.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ssh_key::PrivateKey;
use ssh_key::private::Ed25519Keypair;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

use crate::error::CarapaceError;
use crate::hypervisor::{self, LaunchSpec};
use crate::seed::{self, SeedOptions};
use crate::{paths, qcow2};

/// First port in the loopback range forwarded to guest port 22.
const SSH_PORT_BASE: u16 = 10022;

/// Size of the port window.  The allocator probes each candidate before
/// committing, so more than 100 live runners degrade to a failed
/// allocation rather than a silent collision.
const SSH_PORT_RANGE: u64 = 100;

/// Interval between TCP readiness probes.
const TCP_PROBE_INTERVAL: Duration = Duration::from_secs(2);

/// Shell probe schedule: attempts and spacing.
const SHELL_PROBE_ATTEMPTS: u32 = 20;
const SHELL_PROBE_INTERVAL: Duration = Duration::from_secs(3);

/// Grace between the in-guest power-off request and SIGKILL.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Options shared by every ssh/scp invocation.
///
/// * `StrictHostKeyChecking=no` / `UserKnownHostsFile=/dev/null` — host
///   keys are minted fresh on every boot.
/// * `IdentitiesOnly=yes` — only the ephemeral key, never the agent.
/// * `BatchMode=yes` — fail instead of prompting.
/// * `LogLevel=ERROR` — suppress banner noise.
const SSH_OPTS: &[&str] = &[
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "IdentitiesOnly=yes",
    "-o",
    "BatchMode=yes",
    "-o",
    "LogLevel=ERROR",
    "-o",
    "ConnectTimeout=5",
];

static NEXT_PORT_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Pick a loopback port from the bounded range, probing each candidate
/// with a throwaway bind so busy ports are skipped instead of handed out
/// twice.
fn alloc_ssh_port() -> Result<u16, CarapaceError> {
    for _ in 0..SSH_PORT_RANGE {
        let offset = NEXT_PORT_OFFSET.fetch_add(1, Ordering::Relaxed) % SSH_PORT_RANGE;
        let candidate = SSH_PORT_BASE + offset as u16;
        if std::net::TcpListener::bind(("127.0.0.1", candidate)).is_ok() {
            return Ok(candidate);
        }
    }
    Err(CarapaceError::BootFailure {
        message: format!(
            "no free loopback port in {}..{}",
            SSH_PORT_BASE,
            SSH_PORT_BASE + SSH_PORT_RANGE as u16
        ),
        serial_tail: None,
    })
}

/// Configuration for one runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Shared read-only base image; backing file of every overlay.
    pub base_image: PathBuf,
    /// Guest RAM in MiB.
    pub memory_mb: u32,
    /// Login user baked into the base image.
    pub ssh_user: String,
    /// Budget for the TCP phase of readiness.
    pub ssh_wait_secs: u64,
    /// Default time budget for a single `run`.
    pub task_timeout_secs: u64,
    /// Opt-in: reuse a pre-built `seed.iso` + `id_private` colocated with
    /// the base image instead of minting a fresh identity.  Every runner
    /// booted this way shares one key; leave off unless boot latency of
    /// key generation actually matters to you.
    pub reuse_prebuilt_seed: bool,
}

impl RunnerConfig {
    pub fn new(base_image: impl Into<PathBuf>) -> Self {
        Self {
            base_image: base_image.into(),
            memory_mb: 512,
            ssh_user: "carapace".into(),
            ssh_wait_secs: 120,
            task_timeout_secs: 300,
            reuse_prebuilt_seed: false,
        }
    }
}

/// Outcome of one remote command.  Non-zero exit codes are normal results,
/// not errors — only transport faults surface as `Err`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

/// Outcome of a command sequence.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PipelineResult {
    pub results: Vec<ExecResult>,
    /// True when stop-on-error cut the sequence short.
    pub stopped: bool,
    /// Transport fault that interrupted the pipeline, if any.
    pub error: Option<String>,
}

/// Where and how to reach the guest's shell.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Endpoint {
    pub ssh_port: u16,
    pub user: String,
}

#[derive(Debug)]
struct Inner {
    ssh_port: Option<u16>,
    child: Option<Child>,
    booted: bool,
    shut_down: bool,
}

/// One VM from boot to destruction.
#[derive(Debug)]
pub struct VmRunner {
    id: String,
    config: RunnerConfig,
    work_dir: PathBuf,
    inner: Mutex<Inner>,
    /// `run` is single-flight per instance: two concurrent callers would
    /// interleave on the same forwarded port and confuse timeout handling.
    exec_lock: tokio::sync::Mutex<()>,
}

impl VmRunner {
    pub fn new(config: RunnerConfig) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        let work_dir = paths::work_dir(&id);
        Self {
            id,
            config,
            work_dir,
            inner: Mutex::new(Inner {
                ssh_port: None,
                child: None,
                booted: false,
                shut_down: false,
            }),
            exec_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn endpoint(&self) -> Endpoint {
        let port = self
            .inner
            .lock()
            .expect("runner lock poisoned")
            .ssh_port
            .unwrap_or(0);
        Endpoint {
            ssh_port: port,
            user: self.config.ssh_user.clone(),
        }
    }

    pub fn is_booted(&self) -> bool {
        self.inner.lock().expect("runner lock poisoned").booted
    }

    /// Prepare artifacts, launch the hypervisor, and wait for readiness.
    ///
    /// All-or-nothing: on any failure the child is killed and the work
    /// directory removed before the error is returned.
    pub async fn boot(&self) -> Result<(), CarapaceError> {
        match self.boot_inner().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.cleanup_partial().await;
                Err(e)
            }
        }
    }

    async fn boot_inner(&self) -> Result<(), CarapaceError> {
        let start = Instant::now();
        tokio::fs::create_dir_all(&self.work_dir).await.map_err(|e| {
            CarapaceError::io(format!("creating work dir {}", self.work_dir.display()), e)
        })?;

        self.prepare_identity_and_seed().await?;
        let overlay = paths::overlay_path(&self.work_dir);
        qcow2::create_overlay(&self.config.base_image, &overlay)?;

        let ssh_port = alloc_ssh_port()?;
        let seed = paths::seed_path(&self.work_dir);
        let serial_log = paths::serial_log_path(&self.work_dir);
        let spec = LaunchSpec {
            overlay: &overlay,
            seed: &seed,
            memory_mb: self.config.memory_mb,
            ssh_port,
            serial_log: &serial_log,
        };
        let invocation = hypervisor::invocation(&spec)?;

        tracing::info!(
            id = %self.id,
            binary = %invocation.binary,
            ssh_port,
            "launching hypervisor"
        );
        let child = Command::new(&invocation.binary)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CarapaceError::io(format!("spawning hypervisor {}", invocation.binary), e)
            })?;

        {
            let mut inner = self.inner.lock().expect("runner lock poisoned");
            inner.ssh_port = Some(ssh_port);
            inner.child = Some(child);
        }

        self.wait_for_ssh_port(ssh_port).await?;
        self.wait_for_shell().await?;

        self.inner.lock().expect("runner lock poisoned").booted = true;
        tracing::info!(
            id = %self.id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "VM ready"
        );
        Ok(())
    }

    /// Mint the per-boot key pair and seed, or — strictly opt-in — copy a
    /// pre-built pair colocated with the base image.
    async fn prepare_identity_and_seed(&self) -> Result<(), CarapaceError> {
        if self.config.reuse_prebuilt_seed
            && let Some(base_dir) = self.config.base_image.parent()
        {
            let prebuilt_seed = base_dir.join("seed.iso");
            let prebuilt_key = base_dir.join("id_private");
            if prebuilt_seed.exists() && prebuilt_key.exists() {
                tracing::warn!(id = %self.id, "reusing pre-built seed (shared guest identity)");
                copy_into(&prebuilt_seed, &paths::seed_path(&self.work_dir)).await?;
                copy_into(&prebuilt_key, &paths::key_path(&self.work_dir)).await?;
                set_key_permissions(&paths::key_path(&self.work_dir)).await?;
                return Ok(());
            }
        }

        let public_key = generate_keypair(&self.work_dir).await?;
        seed::build_seed(SeedOptions::new(
            &public_key,
            &paths::seed_path(&self.work_dir),
        ))
        .await?;
        Ok(())
    }

    /// Phase one of readiness: the forwarded port accepts a TCP connection.
    /// Bails out early when the hypervisor dies, carrying the serial tail.
    async fn wait_for_ssh_port(&self, port: u16) -> Result<(), CarapaceError> {
        let deadline = Instant::now() + Duration::from_secs(self.config.ssh_wait_secs);
        loop {
            if let Some(status) = self.try_wait_child() {
                return Err(self.boot_failure(format!("hypervisor exited during boot: {status}")));
            }
            let connect = TcpStream::connect(("127.0.0.1", port));
            if let Ok(Ok(_)) = tokio::time::timeout(TCP_PROBE_INTERVAL, connect).await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(self.boot_failure(format!(
                    "ssh port {port} did not open within {}s",
                    self.config.ssh_wait_secs
                )));
            }
            tokio::time::sleep(TCP_PROBE_INTERVAL).await;
        }
    }

    /// Phase two: a trivial remote command round-trips, proving sshd is up
    /// and the injected key works.
    async fn wait_for_shell(&self) -> Result<(), CarapaceError> {
        for attempt in 1..=SHELL_PROBE_ATTEMPTS {
            if let Some(status) = self.try_wait_child() {
                return Err(self.boot_failure(format!("hypervisor exited during boot: {status}")));
            }
            match self.exec_unlocked("echo SSH_OK", Duration::from_secs(10)).await {
                Ok(res) if res.stdout == "SSH_OK" => return Ok(()),
                Ok(_) | Err(_) if attempt < SHELL_PROBE_ATTEMPTS => {
                    tokio::time::sleep(SHELL_PROBE_INTERVAL).await;
                }
                Ok(res) => {
                    return Err(self.boot_failure(format!(
                        "shell probe returned '{}' instead of SSH_OK",
                        res.stdout
                    )));
                }
                Err(e) => {
                    return Err(self.boot_failure(format!("shell probe never succeeded: {e}")));
                }
            }
        }
        unreachable!("probe loop returns on the final attempt")
    }

    fn try_wait_child(&self) -> Option<std::process::ExitStatus> {
        let mut inner = self.inner.lock().expect("runner lock poisoned");
        inner.child.as_mut().and_then(|c| c.try_wait().ok().flatten())
    }

    fn boot_failure(&self, message: String) -> CarapaceError {
        CarapaceError::BootFailure {
            serial_tail: read_serial_tail(&paths::serial_log_path(&self.work_dir)),
            message,
        }
    }

    /// Execute a command in the guest and collect its full output.
    ///
    /// Returns normally for non-zero exit codes; only transport faults
    /// (spawn failure, timeout) are errors.  Calls on one runner are
    /// serialized internally.
    pub async fn run(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecResult, CarapaceError> {
        if !self.is_booted() {
            return Err(CarapaceError::Transport {
                context: format!("VM {} is not booted", self.id),
                source: None,
            });
        }
        let _guard = self.exec_lock.lock().await;
        let budget = timeout.unwrap_or(Duration::from_secs(self.config.task_timeout_secs));
        self.exec_unlocked(command, budget).await
    }

    async fn exec_unlocked(
        &self,
        command: &str,
        budget: Duration,
    ) -> Result<ExecResult, CarapaceError> {
        let port = self.endpoint().ssh_port;
        let start = Instant::now();

        let child = Command::new("ssh")
            .args(SSH_OPTS)
            .arg("-i")
            .arg(paths::key_path(&self.work_dir))
            .arg("-p")
            .arg(port.to_string())
            .arg(format!("{}@127.0.0.1", self.config.ssh_user))
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CarapaceError::Transport {
                context: "spawning ssh".into(),
                source: Some(e),
            })?;

        // kill_on_drop reaps the ssh child if the timeout wins the race.
        let output = match tokio::time::timeout(budget, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(CarapaceError::Transport {
                    context: "collecting ssh output".into(),
                    source: Some(e),
                });
            }
            Err(_) => {
                return Err(CarapaceError::Transport {
                    context: format!("command timed out after {}s", budget.as_secs()),
                    source: None,
                });
            }
        };

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Run commands in order.  With `stop_on_error` (the default), the
    /// first non-zero exit or transport fault ends the sequence and the
    /// partial results are returned; otherwise every command runs.
    pub async fn run_pipeline(&self, commands: &[String], stop_on_error: bool) -> PipelineResult {
        run_pipeline_on(self, commands, stop_on_error).await
    }

    /// Copy a local file into the guest.
    pub async fn upload(&self, local: &Path, remote: &str) -> Result<(), CarapaceError> {
        self.scp(
            local.display().to_string(),
            format!("{}@127.0.0.1:{remote}", self.config.ssh_user),
        )
        .await
    }

    /// Copy a guest file to the host.
    pub async fn download(&self, remote: &str, local: &Path) -> Result<(), CarapaceError> {
        self.scp(
            format!("{}@127.0.0.1:{remote}", self.config.ssh_user),
            local.display().to_string(),
        )
        .await
    }

    async fn scp(&self, from: String, to: String) -> Result<(), CarapaceError> {
        if !self.is_booted() {
            return Err(CarapaceError::Transport {
                context: format!("VM {} is not booted", self.id),
                source: None,
            });
        }
        let port = self.endpoint().ssh_port;
        let status = Command::new("scp")
            .args(SSH_OPTS)
            .arg("-i")
            .arg(paths::key_path(&self.work_dir))
            .arg("-P")
            .arg(port.to_string())
            .arg(&from)
            .arg(&to)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| CarapaceError::Transport {
                context: "spawning scp".into(),
                source: Some(e),
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(CarapaceError::Transport {
                context: format!("scp {from} -> {to} exited with {status}"),
                source: None,
            })
        }
    }

    /// Tear the VM down: best-effort in-guest power-off, short grace, then
    /// SIGKILL; the serial log is preserved under the temp directory and
    /// the work directory removed unless `keep_work_dir`.
    ///
    /// Idempotent and infallible — errors are logged, never returned.
    pub async fn shutdown(&self, keep_work_dir: bool) {
        let (child, was_booted, already) = {
            let mut inner = self.inner.lock().expect("runner lock poisoned");
            let already = inner.shut_down;
            inner.shut_down = true;
            let was_booted = inner.booted;
            inner.booted = false;
            (inner.child.take(), was_booted, already)
        };
        if already {
            return;
        }

        if was_booted
            && let Err(e) = self.exec_unlocked("sudo poweroff", SHUTDOWN_GRACE).await
        {
            tracing::debug!(id = %self.id, "in-guest poweroff failed: {e}");
        }

        if let Some(mut child) = child {
            let exited = tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await.is_ok();
            if !exited {
                if let Err(e) = child.start_kill() {
                    tracing::debug!(id = %self.id, "killing hypervisor failed: {e}");
                }
                let _ = child.wait().await;
            }
        }

        let serial = paths::serial_log_path(&self.work_dir);
        if serial.exists() {
            let _ = std::fs::copy(&serial, paths::postmortem_log_path(&self.id));
        }

        if !keep_work_dir && self.work_dir.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&self.work_dir).await {
                tracing::warn!(id = %self.id, "removing work dir failed: {e}");
            }
        }
        tracing::info!(id = %self.id, "VM destroyed");
    }

    /// Failure path of `boot`: kill whatever was started and drop the work
    /// directory, leaving nothing behind.
    async fn cleanup_partial(&self) {
        let child = {
            let mut inner = self.inner.lock().expect("runner lock poisoned");
            inner.booted = false;
            inner.shut_down = true;
            inner.child.take()
        };
        if let Some(mut child) = child {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        let serial = paths::serial_log_path(&self.work_dir);
        if serial.exists() {
            let _ = std::fs::copy(&serial, paths::postmortem_log_path(&self.id));
        }
        if self.work_dir.exists() {
            let _ = tokio::fs::remove_dir_all(&self.work_dir).await;
        }
    }
}

/// Sequential pipeline over any guest handle; shared by the runner and the
/// control server's mock-backed tests.
pub async fn run_pipeline_on<V>(vm: &V, commands: &[String], stop_on_error: bool) -> PipelineResult
where
    V: Guest + ?Sized,
{
    let mut results = Vec::with_capacity(commands.len());
    for command in commands {
        match vm.exec(command, None).await {
            Ok(res) => {
                let failed = res.exit_code != 0;
                results.push(res);
                if failed && stop_on_error {
                    return PipelineResult {
                        results,
                        stopped: true,
                        error: None,
                    };
                }
            }
            Err(e) => {
                if stop_on_error {
                    return PipelineResult {
                        results,
                        stopped: true,
                        error: Some(e.to_string()),
                    };
                }
                push_transport_placeholder(&mut results, command);
                tracing::warn!("pipeline command '{command}' transport error: {e}");
            }
        }
    }
    PipelineResult {
        results,
        stopped: false,
        error: None,
    }
}

/// Placeholder result for a command whose transport failed while
/// `stop_on_error` is off, so positions still line up with the input.
fn push_transport_placeholder(results: &mut Vec<ExecResult>, command: &str) {
    results.push(ExecResult {
        stdout: String::new(),
        stderr: format!("transport error running '{command}'"),
        exit_code: -1,
        duration_ms: 0,
    });
}

/// Minimal guest surface the pool and control server operate on.  The
/// production implementation is [`VmRunner`]; tests substitute scripted
/// guests so scheduling and HTTP logic run without a hypervisor.
pub trait Guest: Send + Sync + 'static {
    fn id(&self) -> &str;
    fn endpoint(&self) -> Endpoint;
    fn exec(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> impl std::future::Future<Output = Result<ExecResult, CarapaceError>> + Send;
    fn shutdown(&self) -> impl std::future::Future<Output = ()> + Send;
}

impl Guest for VmRunner {
    fn id(&self) -> &str {
        self.id()
    }

    fn endpoint(&self) -> Endpoint {
        VmRunner::endpoint(self)
    }

    async fn exec(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecResult, CarapaceError> {
        self.run(command, timeout).await
    }

    async fn shutdown(&self) {
        VmRunner::shutdown(self, false).await;
    }
}

/// Boot a fresh VM, run one command, destroy the VM.  Nothing survives.
pub async fn run_isolated(
    config: RunnerConfig,
    command: &str,
) -> Result<ExecResult, CarapaceError> {
    let runner = VmRunner::new(config);
    runner.boot().await?;
    let result = runner.run(command, None).await;
    runner.shutdown(false).await;
    result
}

async fn copy_into(from: &Path, to: &Path) -> Result<(), CarapaceError> {
    tokio::fs::copy(from, to).await.map_err(|e| {
        CarapaceError::io(format!("copying {} to {}", from.display(), to.display()), e)
    })?;
    Ok(())
}

async fn set_key_permissions(key_path: &Path) -> Result<(), CarapaceError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(key_path, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(|e| {
            CarapaceError::io(format!("setting permissions on {}", key_path.display()), e)
        })
}

/// Generate an Ed25519 keypair in the work directory and return the
/// OpenSSH-encoded public key.
async fn generate_keypair(work_dir: &Path) -> Result<String, CarapaceError> {
    let keypair = Ed25519Keypair::random(&mut rand_core::OsRng);
    let private = PrivateKey::from(keypair);

    let key_path = paths::key_path(work_dir);
    let openssh_private = private.to_openssh(ssh_key::LineEnding::LF).map_err(|e| {
        CarapaceError::io(
            format!("encoding private key: {e}"),
            std::io::Error::other(e.to_string()),
        )
    })?;
    tokio::fs::write(&key_path, openssh_private.as_bytes())
        .await
        .map_err(|e| CarapaceError::io(format!("writing key to {}", key_path.display()), e))?;

    // OpenSSH refuses keys with open permissions.
    set_key_permissions(&key_path).await?;

    let public = private.public_key().to_openssh().map_err(|e| {
        CarapaceError::io(
            format!("encoding public key: {e}"),
            std::io::Error::other(e.to_string()),
        )
    })?;
    let pub_path = paths::pub_key_path(work_dir);
    tokio::fs::write(&pub_path, public.as_bytes())
        .await
        .map_err(|e| CarapaceError::io(format!("writing key to {}", pub_path.display()), e))?;

    Ok(public)
}

/// Last ~2 KB of the serial log, for boot-failure diagnostics.
fn read_serial_tail(serial_log: &Path) -> Option<String> {
    let data = std::fs::read(serial_log).ok()?;
    let tail = if data.len() > 2048 {
        &data[data.len() - 2048..]
    } else {
        &data[..]
    };
    Some(String::from_utf8_lossy(tail).into_owned())
}
