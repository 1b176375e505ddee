//! Control-server integration tests.
//!
//! The router is generic over the guest handle, so these tests drive the
//! full HTTP surface against scripted guests — no hypervisor, no image.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;

use carapace::error::CarapaceError;
use carapace::pool::{PoolConfig, WarmPool};
use carapace::runner::{Endpoint, ExecResult, Guest};
use carapace::server::{AppState, router};

/// A guest that interprets just enough shell to exercise the API:
/// `echo X` prints X, `exit N` fails with code N, anything else succeeds
/// silently.
struct ScriptedGuest {
    id: String,
    shut_down: AtomicBool,
}

impl Guest for ScriptedGuest {
    fn id(&self) -> &str {
        &self.id
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint {
            ssh_port: 10022,
            user: "carapace".into(),
        }
    }

    async fn exec(
        &self,
        command: &str,
        _timeout: Option<Duration>,
    ) -> Result<ExecResult, CarapaceError> {
        let (stdout, exit_code) = if let Some(rest) = command.strip_prefix("echo ") {
            (rest.to_string(), 0)
        } else if let Some(code) = command.strip_prefix("exit ") {
            (String::new(), code.trim().parse().unwrap_or(1))
        } else {
            (String::new(), 0)
        };
        Ok(ExecResult {
            stdout,
            stderr: String::new(),
            exit_code,
            duration_ms: 1,
        })
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

fn scripted_boot() -> Arc<
    dyn Fn() -> BoxFuture<'static, Result<Arc<ScriptedGuest>, CarapaceError>> + Send + Sync,
> {
    let counter = Arc::new(AtomicUsize::new(0));
    Arc::new(move || -> BoxFuture<'static, Result<Arc<ScriptedGuest>, CarapaceError>> {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(Arc::new(ScriptedGuest {
                id: format!("scripted-{n}"),
                shut_down: AtomicBool::new(false),
            }))
        })
    })
}

/// Boot a pool of scripted guests and serve the router on an ephemeral
/// loopback port; returns the base URL.
async fn start_server(target: usize, max: usize) -> String {
    let config = PoolConfig {
        target_size: target,
        max_size: max,
        acquire_timeout_ms: 1_000,
        max_warm_age_ms: None,
        refill_debounce_ms: 5,
        boot_retry_delay_ms: 20,
        first_warm_timeout_ms: 2_000,
    };
    let pool = WarmPool::new(config, scripted_boot());
    pool.start().await.expect("pool start");

    let state = AppState::new(pool);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn health_reports_pool_and_uptime() {
    let base = start_server(2, 4).await;
    let body: serde_json::Value = reqwest::get(format!("{base}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["status"], "ok");
    assert_eq!(body["active_vms"], 0);
    assert!(body["pool"]["warm"].as_u64().unwrap() >= 1);
    assert_eq!(body["pool"]["max_size"], 4);
}

#[tokio::test]
async fn acquire_run_release_flow() {
    let base = start_server(1, 2).await;
    let client = reqwest::Client::new();

    let acquired: serde_json::Value = client
        .post(format!("{base}/vms/acquire"))
        .json(&serde_json::json!({ "metadata": { "task": "test" } }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = acquired["id"].as_str().unwrap().to_string();
    assert_eq!(acquired["user"], "carapace");
    assert_eq!(acquired["ssh_port"], 10022);
    assert!(acquired["created_at_ms"].as_u64().unwrap() > 0);
    assert_eq!(acquired["metadata"]["task"], "test");

    let run: serde_json::Value = client
        .post(format!("{base}/vms/{id}/run"))
        .json(&serde_json::json!({ "command": "echo hello" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(run["stdout"], "hello");
    assert_eq!(run["exit_code"], 0);

    let vms: serde_json::Value = client
        .get(format!("{base}/vms"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(vms.as_array().unwrap().len(), 1);
    assert_eq!(vms[0]["id"], id.as_str());
    assert_eq!(vms[0]["metadata"]["task"], "test");

    let released = client
        .post(format!("{base}/vms/{id}/release"))
        .send()
        .await
        .unwrap();
    assert_eq!(released.status(), 200);

    // The identifier is gone for good: release and run both 404 now.
    let again = client
        .post(format!("{base}/vms/{id}/release"))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), 404);
    let run_after = client
        .post(format!("{base}/vms/{id}/run"))
        .json(&serde_json::json!({ "command": "echo x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(run_after.status(), 404);
}

#[tokio::test]
async fn guest_failure_is_a_normal_response() {
    let base = start_server(1, 2).await;
    let client = reqwest::Client::new();

    let acquired: serde_json::Value = client
        .post(format!("{base}/vms/acquire"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = acquired["id"].as_str().unwrap();

    let response = client
        .post(format!("{base}/vms/{id}/run"))
        .json(&serde_json::json!({ "command": "exit 7" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["exit_code"], 7);
}

#[tokio::test]
async fn pipeline_stops_on_error() {
    let base = start_server(1, 2).await;
    let client = reqwest::Client::new();

    let acquired: serde_json::Value = client
        .post(format!("{base}/vms/acquire"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = acquired["id"].as_str().unwrap();

    let body: serde_json::Value = client
        .post(format!("{base}/vms/{id}/pipeline"))
        .json(&serde_json::json!({ "commands": ["echo a", "exit 1", "echo c"] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["stopped"], true);
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["stdout"], "a");
    assert_eq!(results[1]["exit_code"], 1);
}

#[tokio::test]
async fn pipeline_can_continue_past_failures() {
    let base = start_server(1, 2).await;
    let client = reqwest::Client::new();

    let acquired: serde_json::Value = client
        .post(format!("{base}/vms/acquire"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = acquired["id"].as_str().unwrap();

    let body: serde_json::Value = client
        .post(format!("{base}/vms/{id}/pipeline"))
        .json(&serde_json::json!({
            "commands": ["echo a", "exit 1", "echo c"],
            "stop_on_error": false
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["stopped"], false);
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[2]["stdout"], "c");
}

#[tokio::test]
async fn release_of_unknown_id_is_404() {
    let base = start_server(1, 2).await;
    let response = reqwest::Client::new()
        .post(format!("{base}/vms/bogus/release"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn missing_command_field_is_400() {
    let base = start_server(1, 2).await;
    let client = reqwest::Client::new();

    let acquired: serde_json::Value = client
        .post(format!("{base}/vms/acquire"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = acquired["id"].as_str().unwrap();

    let response = client
        .post(format!("{base}/vms/{id}/run"))
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn oversized_body_is_413() {
    let base = start_server(1, 2).await;
    let big = "x".repeat(2 * 1024 * 1024);
    let response = reqwest::Client::new()
        .post(format!("{base}/vms/acquire"))
        .header("content-type", "application/json")
        .body(big)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 413);
}

#[tokio::test]
async fn acquire_times_out_with_503_when_exhausted() {
    let base = start_server(1, 1).await;
    let client = reqwest::Client::new();

    let first = client
        .post(format!("{base}/vms/acquire"))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);

    let second = client
        .post(format!("{base}/vms/acquire"))
        .json(&serde_json::json!({ "timeout_ms": 50 }))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 503);
}

#[tokio::test]
async fn resize_is_validated_and_applied() {
    let base = start_server(2, 8).await;
    let client = reqwest::Client::new();

    let rejected = client
        .post(format!("{base}/pool/resize"))
        .json(&serde_json::json!({ "size": 99 }))
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), 400);

    let accepted: serde_json::Value = client
        .post(format!("{base}/pool/resize"))
        .json(&serde_json::json!({ "size": 4 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(accepted["new_size"], 4);

    // Within the refill debounce plus (scripted) boot time, the pool
    // converges on the new target.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        let status: serde_json::Value = client
            .get(format!("{base}/pool/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let warm = status["stats"]["warm"].as_u64().unwrap();
        let booting = status["stats"]["booting"].as_u64().unwrap();
        if warm + booting >= 4 {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "pool never grew: {status}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn metrics_scrape_reflects_operations() {
    let base = start_server(1, 2).await;
    let client = reqwest::Client::new();

    let acquired: serde_json::Value = client
        .post(format!("{base}/vms/acquire"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = acquired["id"].as_str().unwrap();
    client
        .post(format!("{base}/vms/{id}/run"))
        .json(&serde_json::json!({ "command": "echo hi" }))
        .send()
        .await
        .unwrap();

    let body = client
        .get(format!("{base}/metrics"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("carapace_acquire_total 1"));
    assert!(body.contains("carapace_run_total 1"));
    assert!(body.contains("carapace_active_vms 1"));
    assert!(body.contains("# TYPE carapace_uptime_seconds gauge"));
}
