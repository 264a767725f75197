// Checkpoint, restore and bundle HTTP endpoints.
include!("common/http.rs");

use std::collections::BTreeMap;

use sandbox_studio::sandbox::{CommandOutput, CommandRequest};

fn install_build(app: &TestApp) {
    app.backends.provider.on_command(
        "npm run build",
        Arc::new(|request: &CommandRequest, files: &mut BTreeMap<String, Vec<u8>>| {
            let sha = request
                .env
                .get("STUDIO_COMMIT_SHA")
                .cloned()
                .unwrap_or_default();
            files.insert(
                format!("{WORKING_DIR}/dist/index.html"),
                format!("<html>{sha}</html>").into_bytes(),
            );
            files.insert(
                format!("{WORKING_DIR}/dist/assets/app.js"),
                b"console.log(1)".to_vec(),
            );
            CommandOutput::ok("built")
        }),
    );
}

#[tokio::test]
async fn commit_without_remote_is_skipped() {
    let app = TestApp::new();
    app.project("P1", "alice", "sbx-1").await;
    app.write_file("sbx-1", "src/index.ts", "export {}");

    let payload = app.commit("P1", "alice", "initial layout").await;
    assert_eq!(payload["success"], json!(true));
    assert_eq!(payload["skipped"], json!(true));
    assert_eq!(payload["pushed"], json!(false));
    assert!(payload["commit"].get("bundleUrl").is_none());

    let (status, listing) = send_json(
        &app.app,
        Method::GET,
        "/v1/projects/P1/versions?userId=alice",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let versions = listing["versions"].as_array().cloned().unwrap_or_default();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0]["message"], json!("initial layout"));
    assert_eq!(versions[0]["commitId"], payload["commit"]["githubSHA"]);
    assert!(versions[0].get("bundleUrl").is_none());
    assert!(versions[0]["timestamp"]
        .as_str()
        .is_some_and(|ts| ts.ends_with('Z') && ts.contains('T')));
}

#[tokio::test]
async fn commit_with_remote_pushes() {
    let app = TestApp::new();
    app.project("P1", "alice", "sbx-1").await;
    app.backends.vcs.set_remote("sbx-1", WORKING_DIR, true);

    let payload = app.commit("P1", "alice", "ship it").await;
    assert_eq!(payload["pushed"], json!(true));
    assert_eq!(payload["skipped"], json!(false));
    assert_eq!(app.backends.vcs.push_count("sbx-1", WORKING_DIR), 1);
}

#[tokio::test]
async fn listing_limit_is_capped_server_side() {
    let app = TestApp::new();
    app.project("P1", "alice", "sbx-1").await;
    for n in 0..60 {
        app.write_file("sbx-1", "counter.txt", &n.to_string());
        app.commit("P1", "alice", &format!("change {n}")).await;
    }

    let (status, listing) = send_json(
        &app.app,
        Method::GET,
        "/v1/projects/P1/versions?userId=alice&limit=500",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let versions = listing["versions"].as_array().cloned().unwrap_or_default();
    assert_eq!(versions.len(), 50);
    assert_eq!(versions[0]["message"], json!("change 59"));

    let (_, listing) = send_json(
        &app.app,
        Method::GET,
        "/v1/projects/P1/versions?userId=alice&limit=5",
        None,
    )
    .await;
    assert_eq!(listing["versions"].as_array().map(Vec::len), Some(5));
}

#[tokio::test]
async fn versions_of_someone_elses_project_are_not_found() {
    let app = TestApp::new();
    app.project("P1", "alice", "sbx-1").await;
    let status = send_status(
        &app.app,
        Method::GET,
        "/v1/projects/P1/versions?userId=mallory",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn restore_then_commit_reproduces_the_tree() {
    let app = TestApp::new();
    app.project("P1", "alice", "sbx-1").await;
    app.write_file("sbx-1", "src/index.ts", "original");
    let first = app.commit("P1", "alice", "first").await;
    let first_sha = first["commit"]["githubSHA"].clone();
    let committed = app
        .backends
        .provider
        .snapshot("sbx-1", WORKING_DIR)
        .expect("snapshot");

    app.write_file("sbx-1", "src/index.ts", "edited");
    app.write_file("sbx-1", "src/extra.ts", "extra");
    app.commit("P1", "alice", "second").await;
    app.write_file("sbx-1", "src/index.ts", "uncommitted");

    let (status, payload) = send_json(
        &app.app,
        Method::POST,
        "/v1/projects/P1/restore",
        Some(json!({ "userId": "alice", "commitSHA": first_sha })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "restore: {payload}");
    insta::assert_json_snapshot!(payload, @r###"
    {
      "success": true
    }
    "###);
    assert_eq!(app.read_file("sbx-1", "src/index.ts").as_deref(), Some("original"));
    assert_eq!(app.read_file("sbx-1", "src/extra.ts"), None);

    let again = app.commit("P1", "alice", "after restore").await;
    assert_eq!(again["success"], json!(true));
    let restored = app
        .backends
        .provider
        .snapshot("sbx-1", WORKING_DIR)
        .expect("snapshot");
    assert_eq!(restored, committed);
}

#[tokio::test]
async fn restore_stops_the_dev_server_before_touching_files() {
    let app = TestApp::new();
    app.project("P1", "alice", "sbx-1").await;
    app.write_file("sbx-1", "package.json", "{}");
    let sha = app.commit("P1", "alice", "first").await["commit"]["githubSHA"].clone();

    let status = send_status(
        &app.app,
        Method::POST,
        "/v1/projects/P1/restore",
        Some(json!({ "userId": "alice", "commitSHA": sha })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let commands: Vec<String> = app
        .backends
        .provider
        .commands()
        .into_iter()
        .map(|(_, request)| request.command)
        .collect();
    let kill = commands
        .iter()
        .position(|command| command.starts_with("pkill"))
        .expect("dev server stopped");
    let touch = commands
        .iter()
        .position(|command| command.starts_with("touch -c"))
        .expect("files touched");
    assert!(kill < touch, "{commands:?}");
}

#[tokio::test]
async fn restore_error_shapes() {
    let app = TestApp::new();
    app.project("P1", "alice", "sbx-1").await;
    app.project("P2", "alice", "sbx-2").await;
    app.write_file("sbx-2", "index.ts", "other project");
    let foreign = app.commit("P2", "alice", "p2 commit").await["commit"]["githubSHA"].clone();

    let (status, payload) = send_json(
        &app.app,
        Method::POST,
        "/v1/projects/P1/restore",
        Some(json!({ "userId": "alice" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(payload["success"], json!(false));
    assert!(payload["details"]
        .as_str()
        .is_some_and(|detail| detail.contains("commitSHA")));

    let (status, payload) = send_json(
        &app.app,
        Method::POST,
        "/v1/projects/P1/restore",
        Some(json!({ "userId": "alice", "commitSHA": "deadbeef" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(payload["success"], json!(false));

    let (status, payload) = send_json(
        &app.app,
        Method::POST,
        "/v1/projects/P1/restore",
        Some(json!({ "userId": "alice", "commitSHA": foreign })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND, "{payload}");
    assert_eq!(app.read_file("sbx-2", "index.ts").as_deref(), Some("other project"));
}

#[tokio::test]
async fn restore_during_a_run_is_a_conflict() {
    let app = TestApp::new();
    app.project("P1", "alice", "sbx-1").await;
    let sha = app.commit("P1", "alice", "first").await["commit"]["githubSHA"].clone();

    let run = app.services.locks.begin_run("P1");
    let (status, payload) = send_json(
        &app.app,
        Method::POST,
        "/v1/projects/P1/restore",
        Some(json!({ "userId": "alice", "commitSHA": sha.clone() })),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(payload["success"], json!(false));
    assert_eq!(payload["error"], json!("Conflict"));
    drop(run);

    let status = send_status(
        &app.app,
        Method::POST,
        "/v1/projects/P1/restore",
        Some(json!({ "userId": "alice", "commitSHA": sha })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn bundle_publishes_files_and_legacy_urls_redirect() {
    let app = TestApp::new();
    app.project("P1", "alice", "sbx-1").await;
    install_build(&app);
    app.write_file("sbx-1", "src/index.ts", "export {}");
    let commit = app.commit("P1", "alice", "first").await;
    let sha = commit["commit"]["githubSHA"].as_str().unwrap_or_default().to_string();
    let commit_id = commit["commit"]["id"].as_str().unwrap_or_default().to_string();

    let (status, bundle) = send_json(
        &app.app,
        Method::POST,
        "/v1/projects/P1/bundle",
        Some(json!({ "userId": "alice" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "bundle: {bundle}");
    assert_eq!(bundle["commitId"], json!(commit_id));
    assert_eq!(bundle["files"], json!(2));
    let bundle_url = bundle["bundleUrl"].as_str().unwrap_or_default().to_string();
    assert_eq!(bundle_url, format!("memory://objects/bundles/P1/{sha}/"));
    assert!(app
        .backends
        .objects
        .keys()
        .contains(&format!("bundles/P1/{sha}/manifest.json")));

    let (_, listing) = send_json(
        &app.app,
        Method::GET,
        "/v1/projects/P1/versions?userId=alice",
        None,
    )
    .await;
    assert_eq!(listing["versions"][0]["bundleUrl"], json!(bundle_url));

    let request = Request::builder()
        .method(Method::GET)
        .uri(format!("/v1/bundles/P1/{commit_id}/assets/app.js"))
        .body(Body::empty())
        .expect("redirect request");
    let (status, headers, _) = send_request(&app.app, request).await;
    assert_eq!(status, StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        headers
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok()),
        Some(format!("memory://objects/bundles/P1/{sha}/assets/app.js").as_str())
    );

    let by_sha = Request::builder()
        .method(Method::GET)
        .uri(format!("/v1/bundles/P1/{sha}/index.html"))
        .body(Body::empty())
        .expect("redirect request");
    let (status, _, _) = send_request(&app.app, by_sha).await;
    assert_eq!(status, StatusCode::TEMPORARY_REDIRECT);

    let (status, assets) = send_json(
        &app.app,
        Method::GET,
        "/v1/projects/P1/assets?userId=alice",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let paths: Vec<&str> = assets["assets"]
        .as_array()
        .map(|list| list.iter().filter_map(|asset| asset["path"].as_str()).collect())
        .unwrap_or_default();
    assert_eq!(paths, vec!["assets/app.js", "index.html"]);
}

#[tokio::test]
async fn legacy_redirect_without_bundle_is_not_found() {
    let app = TestApp::new();
    app.project("P1", "alice", "sbx-1").await;
    let commit = app.commit("P1", "alice", "first").await;
    let commit_id = commit["commit"]["id"].as_str().unwrap_or_default().to_string();

    let (status, problem) = send_json(
        &app.app,
        Method::GET,
        &format!("/v1/bundles/P1/{commit_id}/index.html"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(problem["status"], json!(404));

    let status = send_status(
        &app.app,
        Method::GET,
        "/v1/bundles/P1/unknown/index.html",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn bundle_build_failure_is_reported() {
    let app = TestApp::new();
    app.project("P1", "alice", "sbx-1").await;
    app.backends.provider.on_command(
        "npm run build",
        Arc::new(|_: &CommandRequest, _: &mut BTreeMap<String, Vec<u8>>| {
            CommandOutput::failed(1, "missing script: build")
        }),
    );
    app.commit("P1", "alice", "first").await;

    let (status, problem) = send_json(
        &app.app,
        Method::POST,
        "/v1/projects/P1/bundle",
        Some(json!({ "userId": "alice" })),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(problem["status"], json!(500));
    assert!(app.backends.objects.keys().is_empty());
}
