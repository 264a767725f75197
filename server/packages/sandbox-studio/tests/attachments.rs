// Image attachments fetched over HTTP into the sandbox.
include!("common/http.rs");

use std::net::SocketAddr;

use axum::response::{IntoResponse, Redirect};
use axum::routing::get;
use sandbox_studio::attachments::{attachment_client, download_images, ATTACHMENTS_DIR};
use sandbox_studio::sandbox::{MemorySandboxProvider, SandboxSessionManager};
use sandbox_studio_error::SandboxError;

async fn serve_images() -> SocketAddr {
    let router = Router::new()
        .route("/cat.png", get(|| async { b"png-bytes".to_vec() }))
        .route("/moved", get(|| async { Redirect::temporary("/cat.png") }))
        .route("/chain", get(|| async { Redirect::temporary("/moved") }))
        .route(
            "/boom",
            get(|| async { StatusCode::INTERNAL_SERVER_ERROR.into_response() }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind image server");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}

async fn memory_sandbox() -> (Arc<MemorySandboxProvider>, sandbox_studio::sandbox::SandboxHandle) {
    let provider = Arc::new(MemorySandboxProvider::new());
    provider.add_sandbox("sbx-1", WORKING_DIR);
    let handle = SandboxSessionManager::new(provider.clone())
        .connect("sbx-1")
        .await
        .expect("connect");
    (provider, handle)
}

#[tokio::test]
async fn downloads_follow_one_redirect() {
    let addr = serve_images().await;
    let (provider, sandbox) = memory_sandbox().await;
    let client = attachment_client().expect("client");

    let urls = vec![
        format!("http://{addr}/cat.png"),
        format!("http://{addr}/moved"),
    ];
    let paths = download_images(&client, &sandbox, "run-1", &urls)
        .await
        .expect("download");
    assert_eq!(
        paths,
        vec![
            format!("{ATTACHMENTS_DIR}/run-1/0-cat.png"),
            format!("{ATTACHMENTS_DIR}/run-1/1-moved"),
        ]
    );
    for path in &paths {
        assert_eq!(provider.file("sbx-1", path).as_deref(), Some(&b"png-bytes"[..]));
    }
}

#[tokio::test]
async fn second_redirect_and_errors_fail_the_download() {
    let addr = serve_images().await;
    let (_provider, sandbox) = memory_sandbox().await;
    let client = attachment_client().expect("client");

    let chained = download_images(
        &client,
        &sandbox,
        "run-1",
        &[format!("http://{addr}/chain")],
    )
    .await
    .unwrap_err();
    assert!(matches!(chained, SandboxError::Validation { .. }), "{chained}");

    let missing = download_images(
        &client,
        &sandbox,
        "run-1",
        &[format!("http://{addr}/missing.png")],
    )
    .await
    .unwrap_err();
    assert!(matches!(missing, SandboxError::Validation { .. }), "{missing}");

    let boom = download_images(
        &client,
        &sandbox,
        "run-1",
        &[format!("http://{addr}/boom")],
    )
    .await
    .unwrap_err();
    assert!(boom.is_retryable(), "{boom}");
}

#[tokio::test]
async fn run_attaches_downloaded_images_to_the_prompt() {
    let addr = serve_images().await;
    let app = TestApp::new();
    app.project("P1", "alice", "sbx-1").await;

    let (status, outcome) = send_json(
        &app.app,
        Method::POST,
        "/v1/projects/P1/runs",
        Some(json!({
            "userId": "alice",
            "prompt": "match this mockup",
            "imageUrls": [format!("http://{addr}/cat.png")],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "run: {outcome}");

    let requests = app.backends.runtime.requests();
    let request = &requests[0].0;
    assert_eq!(request.image_paths.len(), 1);
    assert!(request.image_paths[0].ends_with("0-cat.png"));
    assert!(request.full_prompt().contains("Attached images:"));
    assert_eq!(
        app.backends
            .provider
            .file("sbx-1", &request.image_paths[0])
            .as_deref(),
        Some(&b"png-bytes"[..])
    );
}

#[tokio::test]
async fn checkpoints_never_contain_attachments() {
    let addr = serve_images().await;
    let app = TestApp::new();
    app.project("P1", "alice", "sbx-1").await;
    app.write_file("sbx-1", "index.html", "<h1>v1</h1>");

    let (status, outcome) = send_json(
        &app.app,
        Method::POST,
        "/v1/projects/P1/runs",
        Some(json!({
            "userId": "alice",
            "prompt": "match this mockup",
            "imageUrls": [format!("http://{addr}/cat.png")],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "run: {outcome}");
    let attachment = app.backends.runtime.requests()[0].0.image_paths[0].clone();
    assert!(!attachment.starts_with(WORKING_DIR), "{attachment}");

    let (_, listing) = send_json(
        &app.app,
        Method::GET,
        "/v1/projects/P1/versions?userId=alice",
        None,
    )
    .await;
    let first_sha = listing["versions"][0]["commitId"].clone();
    let tree = app
        .backends
        .provider
        .snapshot("sbx-1", WORKING_DIR)
        .expect("snapshot");
    assert!(tree.contains_key("index.html"));
    assert!(
        tree.keys().all(|path| !path.ends_with("cat.png")),
        "attachment inside the project tree: {:?}",
        tree.keys().collect::<Vec<_>>()
    );

    app.backends.provider.delete_file("sbx-1", &attachment);
    app.write_file("sbx-1", "index.html", "<h1>v2</h1>");
    app.commit("P1", "alice", "second").await;

    let status = send_status(
        &app.app,
        Method::POST,
        "/v1/projects/P1/restore",
        Some(json!({ "userId": "alice", "commitSHA": first_sha })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.read_file("sbx-1", "index.html").as_deref(), Some("<h1>v1</h1>"));
    assert_eq!(app.backends.provider.file("sbx-1", &attachment), None);
}
