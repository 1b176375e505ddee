//! End-to-end tests against a real base image.
//!
//! These boot actual VMs and need a hypervisor plus a CarapaceOS qcow2
//! image, so they are `#[ignore]`d by default.  Run them with:
//!
//! ```sh
//! CARAPACE_IMAGE=/path/to/carapaceos.qcow2 cargo test --test vm_e2e -- --ignored
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use carapace::error::CarapaceError;
use carapace::pool::{PoolConfig, WarmPool};
use carapace::runner::{RunnerConfig, VmRunner, run_isolated};

fn base_image() -> PathBuf {
    PathBuf::from(
        std::env::var("CARAPACE_IMAGE").expect("set CARAPACE_IMAGE to a CarapaceOS qcow2"),
    )
}

fn runner_config() -> RunnerConfig {
    RunnerConfig::new(base_image())
}

#[tokio::test]
#[ignore = "boots a real VM"]
async fn run_isolated_echo_round_trip() {
    let result = run_isolated(runner_config(), "echo hello").await.unwrap();
    assert_eq!(result.stdout, "hello");
    assert_eq!(result.exit_code, 0);
}

#[tokio::test]
#[ignore = "boots a real VM"]
async fn run_isolated_leaves_no_work_dir() {
    let runner = VmRunner::new(runner_config());
    let work = runner.work_dir().to_path_buf();
    runner.boot().await.unwrap();
    assert!(work.exists());
    runner.shutdown(false).await;
    assert!(!work.exists(), "work dir must be removed on shutdown");
}

#[tokio::test]
#[ignore = "boots two real VMs"]
async fn overlay_writes_do_not_leak_into_the_base() {
    // First guest writes a marker and is destroyed with its overlay.
    let first = VmRunner::new(runner_config());
    first.boot().await.unwrap();
    let write = first
        .run("echo x > /tmp/mark && cat /tmp/mark", None)
        .await
        .unwrap();
    assert_eq!(write.exit_code, 0);
    first.shutdown(false).await;

    // A fresh guest over the same base must not see it.
    let second = VmRunner::new(runner_config());
    second.boot().await.unwrap();
    let check = second.run("test -e /tmp/mark", None).await.unwrap();
    assert_ne!(check.exit_code, 0, "marker leaked across overlays");
    second.shutdown(false).await;
}

#[tokio::test]
#[ignore = "boots a real VM"]
async fn non_zero_exits_are_results_not_errors() {
    let runner = VmRunner::new(runner_config());
    runner.boot().await.unwrap();
    let result = runner.run("exit 3", None).await.unwrap();
    assert_eq!(result.exit_code, 3);
    runner.shutdown(false).await;
}

#[tokio::test]
#[ignore = "boots a real VM"]
async fn upload_download_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("payload.txt");
    std::fs::write(&local, "payload contents\n").unwrap();

    let runner = VmRunner::new(runner_config());
    runner.boot().await.unwrap();
    runner.upload(&local, "/tmp/payload.txt").await.unwrap();

    let fetched = dir.path().join("fetched.txt");
    runner.download("/tmp/payload.txt", &fetched).await.unwrap();
    assert_eq!(std::fs::read_to_string(&fetched).unwrap(), "payload contents\n");
    runner.shutdown(false).await;
}

#[tokio::test]
#[ignore = "boots a real VM without acceleration"]
async fn boot_succeeds_without_acceleration() {
    // SAFETY: test process is single-threaded at this point of setup; the
    // variable only influences child argv construction.
    unsafe { std::env::set_var("ENABLE_ACCEL", "0") };
    let mut config = runner_config();
    config.ssh_wait_secs = 300; // pure emulation is ~4x slower
    let result = run_isolated(config, "echo slow-but-alive").await.unwrap();
    assert_eq!(result.stdout, "slow-but-alive");
    unsafe { std::env::remove_var("ENABLE_ACCEL") };
}

#[tokio::test]
#[ignore = "boots several real VMs"]
async fn pool_hands_out_isolated_vms() {
    let config = runner_config();
    let boot = Arc::new(move || -> BoxFuture<'static, Result<Arc<VmRunner>, CarapaceError>> {
        let config = config.clone();
        Box::pin(async move {
            let runner = Arc::new(VmRunner::new(config));
            runner.boot().await?;
            Ok(runner)
        })
    });

    let pool = WarmPool::new(
        PoolConfig {
            target_size: 2,
            max_size: 3,
            ..PoolConfig::default()
        },
        boot,
    );
    pool.start().await.unwrap();
    assert!(pool.stats().warm >= 1);

    let a = pool.acquire(None).await.unwrap();
    let b = pool.acquire(None).await.unwrap();
    assert_ne!(a.id(), b.id());

    // Both held, nothing warm left: a short acquire must time out.
    let err = pool.acquire(Some(50)).await.unwrap_err();
    assert!(matches!(err, CarapaceError::PoolExhausted { .. }));

    pool.release(&a);
    pool.release(&b);
    pool.stop().await;
}
