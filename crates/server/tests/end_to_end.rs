//! End-to-end: versions listing, batch submission with a partial engine
//! failure, polling, streaming, download and purge, all through the HTTP
//! router.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use pretty_assertions::assert_eq;
use qmd_hasher_core::{EngineError, GcdCache, HashEngine, Hashtab, HashtabFormat, SourceRegistry};
use qmd_hasher_jobs::{JobStore, JobStoreConfig};
use qmd_hasher_server::{create_app, AppState, Config};
use tower::ServiceExt;

const VERSION: &str = "3.25.0.140";
const BOUNDARY: &str = "end-to-end-boundary";

/// Merges by concatenation; refuses to hash `second.qmd`.
#[derive(Default)]
struct ScriptedEngine {
    merges: AtomicUsize,
}

#[async_trait]
impl HashEngine for ScriptedEngine {
    async fn merge_hashtabs(&self, output: &Path, inputs: &[PathBuf]) -> Result<(), EngineError> {
        self.merges.fetch_add(1, Ordering::SeqCst);
        let mut merged = Vec::new();
        for input in inputs {
            merged.extend(std::fs::read(input).unwrap());
        }
        std::fs::write(output, merged).unwrap();
        Ok(())
    }

    async fn hash_diffs(&self, _hashtab: &Path, target: &Path) -> Result<(), EngineError> {
        if target.ends_with("second.qmd") {
            return Err(EngineError::Failed {
                command: "hash-diffs".to_string(),
                code: Some(2),
                stderr: "unresolved identifier".to_string(),
                stdout: String::new(),
            });
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

fn setup(dir: &Path) -> (Router, Arc<ScriptedEngine>) {
    let hashtab_dir = dir.join("hashtables");
    std::fs::create_dir_all(&hashtab_dir).unwrap();
    for device in ["rmppm", "rm2", "rm1", "rmpp"] {
        let bytes = Hashtab::encode(HashtabFormat::Hashtab, VERSION, device, &[(7, "Rectangle")]).unwrap();
        std::fs::write(hashtab_dir.join(format!("{VERSION}-{device}")), bytes).unwrap();
    }

    let config = Config {
        hashtab_dir: hashtab_dir.clone(),
        gcd_dir: dir.join("gcd"),
        reload_interval: Duration::ZERO,
        ..Config::default()
    };
    let registry = Arc::new(SourceRegistry::open(&hashtab_dir, config.reload_interval).unwrap());
    let engine = Arc::new(ScriptedEngine::default());
    let gcd = Arc::new(GcdCache::new(&config.gcd_dir, registry, engine.clone()).unwrap());
    let jobs = JobStore::new(JobStoreConfig::default());
    let state = AppState::new(config, gcd, engine.clone(), jobs);
    (create_app(state), engine)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, String) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn submit(version: &str, files: &[(&str, &str)]) -> Request<Body> {
    let mut body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"version\"\r\n\r\n{version}\r\n"
    );
    for (name, content) in files {
        body.push_str(&format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"{name}\"\r\n\r\n{content}\r\n"
        ));
    }
    body.push_str(&format!("--{BOUNDARY}--\r\n"));

    Request::builder()
        .method("POST")
        .uri("/api/hash")
        .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn partial_failure_batch_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let (app, engine) = setup(dir.path());

    // Versions: one entry, four devices in name order.
    let (status, body) = send(&app, get("/api/versions")).await;
    assert_eq!(status, StatusCode::OK);
    let versions: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(versions["count"], 1);
    assert_eq!(versions["versions"][0]["version"], VERSION);
    assert_eq!(versions["versions"][0]["deviceCount"], 4);
    assert_eq!(
        versions["versions"][0]["devices"],
        serde_json::json!(["rm1", "rm2", "rmpp", "rmppm"])
    );

    // Submit two files; the engine rejects the second.
    let (status, body) = send(
        &app,
        submit(VERSION, &[("first.qmd", "Item { id: a }"), ("second.qmd", "Item { id: b }")]),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let job_id = serde_json::from_str::<serde_json::Value>(&body).unwrap()["jobId"]
        .as_str()
        .unwrap()
        .to_string();

    // Poll until the job is finished.
    let uri = format!("/api/results/{job_id}");
    let record = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let (status, body) = send(&app, get(&uri)).await;
            match status {
                StatusCode::OK => break serde_json::from_str::<serde_json::Value>(&body).unwrap(),
                StatusCode::ACCEPTED => tokio::time::sleep(Duration::from_millis(10)).await,
                other => panic!("unexpected status {other}: {body}"),
            }
        }
    })
    .await
    .expect("job did not finish");

    assert_eq!(record["status"], "success");
    assert_eq!(record["message"], "Hashed 1 file(s)");
    assert_eq!(record["fileCount"], 2);
    assert_eq!(record["progress"], 100);
    let files = record["files"].as_array().unwrap();
    assert_eq!(files.len(), 2);
    assert_eq!(files[0]["name"], "first.qmd");
    assert_eq!(files[0]["status"], "success");
    assert_eq!(files[1]["name"], "second.qmd");
    assert_eq!(files[1]["status"], "error");
    assert!(!files[1]["error"].as_str().unwrap().is_empty());
    assert_eq!(engine.merges.load(Ordering::SeqCst), 1);

    // A late stream subscriber gets exactly the terminal record.
    let (status, body) = send(&app, get(&format!("/api/status/stream/{job_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    let events: Vec<serde_json::Value> = body
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(|data| serde_json::from_str(data).unwrap())
        .collect();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0], record);

    // One file succeeded, so the download is that file on its own.
    let (status, body) = send(&app, get(&format!("/api/download/{job_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Item { id: a }");

    // Purge.
    let delete = Request::builder()
        .method("DELETE")
        .uri(format!("/api/jobs/{job_id}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, delete).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, get(&uri)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_version_fails_job() {
    let dir = tempfile::tempdir().unwrap();
    let (app, engine) = setup(dir.path());

    let (status, body) = send(&app, submit("1.0.0.0", &[("a.qmd", "Item {}")])).await;
    assert_eq!(status, StatusCode::OK);
    let job_id = serde_json::from_str::<serde_json::Value>(&body).unwrap()["jobId"]
        .as_str()
        .unwrap()
        .to_string();

    let uri = format!("/api/results/{job_id}");
    let record = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let (status, body) = send(&app, get(&uri)).await;
            if status == StatusCode::OK {
                break serde_json::from_str::<serde_json::Value>(&body).unwrap();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job did not finish");

    assert_eq!(record["status"], "error");
    assert_eq!(
        record["message"],
        "Version 1.0.0.0 not available: No hashtabs found for version 1.0.0.0"
    );
    assert_eq!(engine.merges.load(Ordering::SeqCst), 0);
}
