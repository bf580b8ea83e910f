//! Integration tests for the defectsim HTTP server and CLI-level pipeline.

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use tokio::net::TcpListener;

use defectsim::random::{RandomSource, SeededSource, SourceFactory};
use defectsim::server::*;
use defectsim::{DetectorConfig, LatencyRange};

// ---------------------------------------------------------------------------
// Helper: spin up a test server on an ephemeral port
// ---------------------------------------------------------------------------

struct TestServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    _upload_dir: tempfile::TempDir,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

fn test_config(upload_dir: &std::path::Path, latency: LatencyRange) -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        rate_limit_rpm: 0, // no rate limiting in tests
        access_log_path: "/dev/null".to_string(),
        max_access_log_bytes: 0,
        upload_dir: upload_dir.to_path_buf(),
        detector: DetectorConfig {
            latency,
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn serve(state: Arc<ServerState>, upload_dir: tempfile::TempDir) -> TestServer {
    let app = build_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    // Give the server a moment to start
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        addr,
        state,
        _upload_dir: upload_dir,
    }
}

async fn spawn_test_server() -> TestServer {
    spawn_test_server_with(|_| {}, None).await
}

async fn spawn_test_server_with(
    tweak: impl FnOnce(&mut ServerConfig),
    sources: Option<Arc<dyn SourceFactory>>,
) -> TestServer {
    let upload_dir = tempfile::tempdir().expect("failed to create temp dir");
    let mut config = test_config(upload_dir.path(), LatencyRange::new(0.0, 0.02).unwrap());
    tweak(&mut config);
    let state = match sources {
        Some(f) => ServerState::with_source_factory(config, f),
        None => ServerState::new(config),
    };
    serve(Arc::new(state), upload_dir).await
}

fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
        width,
        height,
        image::Rgb([120, 120, 130]),
    ));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
    buf.into_inner()
}

fn file_part(name: &str, bytes: Vec<u8>) -> Part {
    Part::bytes(bytes).file_name(name.to_string())
}

async fn post_file(server: &TestServer, path: &str, name: &str, bytes: Vec<u8>) -> reqwest::Response {
    let form = Form::new().part("file", file_part(name, bytes));
    reqwest::Client::new()
        .post(server.url(path))
        .multipart(form)
        .send()
        .await
        .unwrap()
}

/// Random source whose Dirichlet draw always fails.
struct FailingSource;

impl RandomSource for FailingSource {
    fn sample_dirichlet(&mut self, _alpha: &[f64]) -> eyre::Result<Vec<f64>> {
        eyre::bail!("entropy pool exhausted")
    }

    fn uniform_int(&mut self, low: usize, _high: usize) -> usize {
        low
    }

    fn uniform_f64(&mut self, low: f64, _high: f64) -> f64 {
        low
    }
}

/// Random source that panics mid-simulation.
struct PanickingSource;

impl RandomSource for PanickingSource {
    fn sample_dirichlet(&mut self, _alpha: &[f64]) -> eyre::Result<Vec<f64>> {
        panic!("generator state corrupted")
    }

    fn uniform_int(&mut self, low: usize, _high: usize) -> usize {
        low
    }

    fn uniform_f64(&mut self, low: f64, _high: f64) -> f64 {
        low
    }
}

fn assert_distribution(probs: &serde_json::Value) {
    let map = probs.as_object().expect("all_probabilities is an object");
    assert_eq!(map.len(), 6);
    let sum: f64 = map.values().map(|v| v.as_f64().unwrap()).sum();
    assert!((sum - 1.0).abs() < 1e-6, "probabilities sum to {}", sum);
    assert!(map.values().all(|v| {
        let p = v.as_f64().unwrap();
        (0.0..=1.0).contains(&p)
    }));
}

// ---------------------------------------------------------------------------
// Integration tests: detection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_detect_keyword_filename() {
    let server = spawn_test_server().await;
    let resp = post_file(&server, "/api/detect", "sample_crack_01.jpg", vec![0xAB; 4096]).await;
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    let data = &body["data"];
    assert_eq!(data["defect_type"], "Crazing (裂纹)");
    assert_eq!(data["matched_keyword"], "crack");
    assert_eq!(data["image_info"]["filename"], "sample_crack_01.jpg");
    assert_eq!(data["image_info"]["size"], 1024);
    assert_distribution(&data["all_probabilities"]);
    assert_eq!(
        data["confidence"],
        data["all_probabilities"]["Crazing (裂纹)"]
    );
    assert!(data["timestamp"].as_str().is_some());
}

#[tokio::test]
async fn test_detect_unmatched_png_is_valid() {
    let server = spawn_test_server().await;
    let resp = post_file(&server, "/api/detect", "noise.png", png_bytes(64, 48)).await;
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = resp.json().await.unwrap();
    let data = &body["data"];
    let labels: Vec<String> = defectsim::labels::class_labels()
        .into_iter()
        .map(|l| l.name.to_string())
        .collect();
    assert!(labels.contains(&data["defect_type"].as_str().unwrap().to_string()));
    assert!(data.get("matched_keyword").is_none());
    assert_distribution(&data["all_probabilities"]);
    assert_eq!(data["image_info"]["width"], 64);
    assert_eq!(data["image_info"]["height"], 48);
    assert_eq!(data["image_info"]["format"], "PNG");

    // Decoded uploads refresh the stored preview.
    assert!(server.state.previews.latest_path().exists());
}

#[tokio::test]
async fn test_detect_undecodable_bytes_still_classified() {
    let server = spawn_test_server().await;
    let resp = post_file(&server, "/api/detect", "scratch_7.bmp", b"not really a bitmap".to_vec()).await;
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["data"]["defect_type"], "Scratches (划痕)");
    assert!(body["data"]["image_info"].get("width").is_none());
}

#[tokio::test]
async fn test_detect_missing_file_returns_400() {
    let server = spawn_test_server().await;
    let form = Form::new().text("note", "no file here");
    let resp = reqwest::Client::new()
        .post(server.url("/api/detect"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "No file uploaded");
}

#[tokio::test]
async fn test_detect_non_multipart_returns_400() {
    let server = spawn_test_server().await;
    let resp = reqwest::Client::new()
        .post(server.url("/api/detect"))
        .header("content-type", "application/json")
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_detect_empty_filename_returns_400() {
    let server = spawn_test_server().await;
    let resp = post_file(&server, "/api/detect", "", vec![1, 2, 3]).await;
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "No file selected");
}

#[tokio::test]
async fn test_detect_unsupported_format_returns_400() {
    let server = spawn_test_server().await;
    let resp = post_file(&server, "/api/detect", "report.txt", b"hello".to_vec()).await;
    assert_eq!(resp.status(), 400);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Unsupported file format: txt");
    assert!(body.get("data").is_none());
}

#[tokio::test]
async fn test_failing_random_source_returns_500() {
    let factory: Arc<dyn SourceFactory> =
        Arc::new(|| Box::new(FailingSource) as Box<dyn RandomSource>);
    let server = spawn_test_server_with(|_| {}, Some(factory)).await;

    let resp = post_file(&server, "/api/detect", "pit_3.png", vec![0; 16]).await;
    assert_eq!(resp.status(), 500);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    let error = body["error"].as_str().unwrap();
    assert!(!error.is_empty());
    assert!(error.contains("entropy pool exhausted"), "got: {}", error);
}

#[tokio::test]
async fn test_panicking_random_source_returns_500() {
    let factory: Arc<dyn SourceFactory> =
        Arc::new(|| Box::new(PanickingSource) as Box<dyn RandomSource>);
    let server = spawn_test_server_with(|_| {}, Some(factory)).await;

    let resp = post_file(&server, "/api/detect", "pit_3.png", vec![0; 16]).await;
    assert_eq!(resp.status(), 500);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert!(!body["error"].as_str().unwrap().is_empty());

    // The server keeps serving after a panicked detection.
    let health = reqwest::get(server.url("/api/health")).await.unwrap();
    assert_eq!(health.status(), 200);
}

#[tokio::test]
async fn test_fixed_seed_is_reproducible_across_servers() {
    let mut bodies = Vec::new();
    for _ in 0..2 {
        let factory: Arc<dyn SourceFactory> =
            Arc::new(|| Box::new(SeededSource::from_seed(2024)) as Box<dyn RandomSource>);
        let server = spawn_test_server_with(|_| {}, Some(factory)).await;
        let resp = post_file(&server, "/api/detect", "noise.png", vec![0; 32]).await;
        let body: serde_json::Value = resp.json().await.unwrap();
        bodies.push(body["data"]["all_probabilities"].clone());
    }
    assert_eq!(bodies[0], bodies[1]);
}

#[tokio::test]
async fn test_shutdown_cancels_in_flight_detection() {
    let upload_dir = tempfile::tempdir().expect("failed to create temp dir");
    let config = test_config(upload_dir.path(), LatencyRange::new(10.0, 10.0).unwrap());
    let server = serve(Arc::new(ServerState::new(config)), upload_dir).await;

    let url = server.url("/api/detect");
    let request = tokio::spawn(async move {
        let form = Form::new().part("file", file_part("crack.png", vec![0; 8]));
        reqwest::Client::new().post(url).multipart(form).send().await.unwrap()
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    server.state.begin_shutdown();

    let resp = tokio::time::timeout(Duration::from_secs(5), request)
        .await
        .expect("in-flight detection should be released promptly")
        .unwrap();
    assert_eq!(resp.status(), 500);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("shutting down"));
}

#[tokio::test]
async fn test_rate_limit_returns_429() {
    let server = spawn_test_server_with(|c| c.rate_limit_rpm = 1, None).await;

    let first = post_file(&server, "/api/detect", "inclusion.png", vec![0; 8]).await;
    assert_eq!(first.status(), 200);

    let second = post_file(&server, "/api/detect", "inclusion.png", vec![0; 8]).await;
    assert_eq!(second.status(), 429);
    let body: serde_json::Value = second.json().await.unwrap();
    assert_eq!(body["success"], false);
}

// ---------------------------------------------------------------------------
// Integration tests: batch and preview
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_batch_detect_preserves_order() {
    let server = spawn_test_server().await;
    let form = Form::new()
        .part("files", file_part("a_crack.png", vec![0; 8]))
        .part("files", file_part("notes.txt", vec![0; 8]))
        .part("files", file_part("b_scale.jpg", vec![0; 8]));
    let resp = reqwest::Client::new()
        .post(server.url("/api/batch/detect"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["total"], 3);
    let results = body["results"].as_array().unwrap();
    assert_eq!(results[0]["filename"], "a_crack.png");
    assert_eq!(results[0]["success"], true);
    assert_eq!(results[0]["defect_type"], "Crazing (裂纹)");
    assert_eq!(results[1]["success"], false);
    assert_eq!(results[1]["error"], "Unsupported file format: txt");
    assert_eq!(results[2]["defect_type"], "Rolled-in Scale (轧制氧化皮)");
}

#[tokio::test]
async fn test_batch_detect_rejects_too_many_files() {
    let server = spawn_test_server_with(|c| c.max_batch_files = 2, None).await;
    let mut form = Form::new();
    for i in 0..3 {
        form = form.part("files", file_part(&format!("img_{i}.png"), vec![0; 4]));
    }
    let resp = reqwest::Client::new()
        .post(server.url("/api/batch/detect"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_preview_returns_data_url() {
    let server = spawn_test_server().await;
    let resp = post_file(&server, "/api/preview", "wide.png", png_bytes(800, 200)).await;
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["width"], 800);
    assert_eq!(body["data"]["height"], 200);
    assert!(body["data"]["preview"]
        .as_str()
        .unwrap()
        .starts_with("data:image/jpeg;base64,"));
}

#[tokio::test]
async fn test_preview_rejects_undecodable_image() {
    let server = spawn_test_server().await;
    let resp = post_file(&server, "/api/preview", "broken.png", b"garbage".to_vec()).await;
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
}

// ---------------------------------------------------------------------------
// Integration tests: service endpoints
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_health_endpoint() {
    let server = spawn_test_server().await;
    let resp = reqwest::get(server.url("/api/health")).await.unwrap();
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert!(body["version"].as_str().is_some());
    assert!(body["timestamp"].as_str().is_some());
    assert!(body["message"].as_str().is_some());
}

#[tokio::test]
async fn test_stats_counts_detections_and_errors() {
    let server = spawn_test_server().await;
    post_file(&server, "/api/detect", "patch.png", vec![0; 8]).await;
    post_file(&server, "/api/detect", "bad.exe", vec![0; 8]).await;

    let resp = reqwest::get(server.url("/api/stats")).await.unwrap();
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    let data = &body["data"];
    assert_eq!(data["total_requests"], 2);
    assert_eq!(data["total_errors"], 1);
    assert_eq!(data["system_status"], "running");
    assert_eq!(data["model_type"], "simulation");
    assert_eq!(data["classifications"]["Patches (斑块)"], 1);
    assert_eq!(data["endpoints"]["detect"], 2);
}

#[tokio::test]
async fn test_labels_endpoint() {
    let server = spawn_test_server().await;
    let body: serde_json::Value = reqwest::get(server.url("/api/labels"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let labels = body["labels"].as_array().unwrap();
    assert_eq!(labels.len(), 6);
    assert_eq!(labels[0]["index"], 0);
    assert_eq!(labels[0]["name"], "Crazing (裂纹)");
    assert_eq!(labels[5]["name"], "Scratches (划痕)");
}

#[tokio::test]
async fn test_index_page_served() {
    let server = spawn_test_server().await;
    let resp = reqwest::get(server.url("/")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let html = resp.text().await.unwrap();
    assert!(html.contains("/api/detect"));
}
