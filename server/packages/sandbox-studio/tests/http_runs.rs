// Run trigger, auth and sandbox lifecycle endpoints.
include!("common/http.rs");

use sandbox_studio::runtime::ScriptStep;
use sandbox_studio::sandbox::SandboxStatus;
use sandbox_studio_agent_schema::AgentMessage;

fn run_body(user_id: &str, prompt: &str) -> Value {
    json!({ "userId": user_id, "prompt": prompt })
}

#[tokio::test]
async fn run_completes_and_checkpoints() {
    let app = TestApp::new();
    app.project("P1", "alice", "sbx-1").await;
    app.write_file("sbx-1", "src/index.ts", "export {}");

    let (status, outcome) = send_json(
        &app.app,
        Method::POST,
        "/v1/projects/P1/runs",
        Some(run_body("alice", "add a footer")),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "run: {outcome}");
    assert_eq!(outcome["success"], json!(true));
    assert_eq!(outcome["state"], json!("completed"));
    let messages = outcome["messages"].as_array().cloned().unwrap_or_default();
    assert_eq!(
        messages,
        vec![
            json!({ "type": "assistantText", "text": "received: add a footer" }),
            json!({ "type": "runComplete", "result": "done" }),
        ]
    );

    let (_, listing) = send_json(
        &app.app,
        Method::GET,
        "/v1/projects/P1/versions?userId=alice",
        None,
    )
    .await;
    assert_eq!(listing["versions"][0]["message"], json!("Agent: add a footer"));

    let requests = app.backends.runtime.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0.project_id, "P1");
    assert_eq!(requests[0].0.cwd, WORKING_DIR);
    assert!(!app.services.locks.is_running("P1"));
}

#[tokio::test]
async fn run_against_missing_sandbox_is_not_found() {
    let app = TestApp::new();
    let status = send_status(
        &app.app,
        Method::POST,
        "/v1/projects",
        Some(json!({ "projectId": "P1", "userId": "alice", "sandboxId": "gone" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, outcome) = send_json(
        &app.app,
        Method::POST,
        "/v1/projects/P1/runs",
        Some(run_body("alice", "hello")),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND, "run: {outcome}");
    assert_eq!(outcome["success"], json!(false));
    assert_eq!(outcome["state"], json!("failed"));
    assert_eq!(app.backends.runtime.open_count(), 0);

    let (_, listing) = send_json(
        &app.app,
        Method::GET,
        "/v1/projects/P1/versions?userId=alice",
        None,
    )
    .await;
    assert_eq!(listing["versions"], json!([]));
}

#[tokio::test]
async fn run_validation_errors() {
    let app = TestApp::new();
    app.project("P1", "alice", "sbx-1").await;

    let (status, problem) = send_json(
        &app.app,
        Method::POST,
        "/v1/projects/P1/runs",
        Some(json!({ "prompt": "hi" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(problem["detail"]
        .as_str()
        .is_some_and(|detail| detail.contains("userId")));

    let (status, problem) = send_json(
        &app.app,
        Method::POST,
        "/v1/projects/P1/runs",
        Some(json!({ "userId": "alice" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(problem["detail"]
        .as_str()
        .is_some_and(|detail| detail.contains("prompt")));

    let status = send_status(
        &app.app,
        Method::POST,
        "/v1/projects/P1/runs",
        Some(json!({ "userId": "alice", "prompt": "hi", "cwd": "relative/dir" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let status = send_status(
        &app.app,
        Method::POST,
        "/v1/projects/P1/runs",
        Some(run_body("mallory", "hi")),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(app.backends.runtime.open_count(), 0);
}

#[tokio::test]
async fn system_prompt_file_is_read_from_the_sandbox() {
    let app = TestApp::new();
    app.project("P1", "alice", "sbx-1").await;
    app.write_file("sbx-1", "prompts/system.md", "You are a careful engineer.");

    let (status, outcome) = send_json(
        &app.app,
        Method::POST,
        "/v1/projects/P1/runs",
        Some(json!({
            "userId": "alice",
            "prompt": "hi",
            "systemPrompt": "ignored",
            "systemPromptFile": "prompts/system.md",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "run: {outcome}");
    let requests = app.backends.runtime.requests();
    assert_eq!(
        requests[0].0.system_prompt.as_deref(),
        Some("You are a careful engineer.")
    );

    for path in ["/etc/passwd", "../../../etc/passwd"] {
        let (status, problem) = send_json(
            &app.app,
            Method::POST,
            "/v1/projects/P1/runs",
            Some(json!({ "userId": "alice", "prompt": "hi", "systemPromptFile": path })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{path}: {problem}");
        assert!(problem["detail"]
            .as_str()
            .is_some_and(|detail| detail.contains("systemPromptFile")));
    }

    let (status, outcome) = send_json(
        &app.app,
        Method::POST,
        "/v1/projects/P1/runs",
        Some(json!({ "userId": "alice", "prompt": "hi", "systemPromptFile": "missing.md" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "run: {outcome}");
    assert_eq!(outcome["success"], json!(false));
    assert_eq!(app.backends.runtime.open_count(), 1);
}

#[tokio::test]
async fn deploy_hook_requires_a_configured_command() {
    let app = TestApp::new();
    app.project("P1", "alice", "sbx-1").await;

    let (status, problem) = send_json(
        &app.app,
        Method::POST,
        "/v1/projects/P1/runs",
        Some(json!({ "userId": "alice", "prompt": "hi", "withDeployHook": true })),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(problem["title"], json!("Server misconfigured"));
    assert_eq!(app.backends.runtime.open_count(), 0);
}

#[tokio::test]
async fn agent_error_fails_the_run_without_a_checkpoint() {
    let app = TestApp::new();
    app.project("P1", "alice", "sbx-1").await;
    app.backends.runtime.push_script(vec![
        ScriptStep::Message(AgentMessage::AssistantText {
            text: "working".to_string(),
        }),
        ScriptStep::Message(AgentMessage::RunError {
            message: "model overloaded".to_string(),
        }),
    ]);

    let (status, outcome) = send_json(
        &app.app,
        Method::POST,
        "/v1/projects/P1/runs",
        Some(run_body("alice", "hi")),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(outcome["success"], json!(false));
    assert_eq!(outcome["state"], json!("failed"));
    assert_eq!(outcome["messages"].as_array().map(Vec::len), Some(2));

    let (_, listing) = send_json(
        &app.app,
        Method::GET,
        "/v1/projects/P1/versions?userId=alice",
        None,
    )
    .await;
    assert_eq!(listing["versions"], json!([]));
}

#[tokio::test]
async fn file_edits_during_a_run_reach_subscribers() {
    let app = TestApp::new();
    app.project("P1", "alice", "sbx-1").await;
    app.backends.runtime.push_script(vec![
        ScriptStep::Message(AgentMessage::ToolInvocation {
            id: "tool-1".to_string(),
            name: "Write".to_string(),
            input: json!({ "file_path": "src/Footer.tsx", "content": "x" }),
        }),
        ScriptStep::Message(AgentMessage::RunComplete {
            result: None,
            duration_ms: None,
        }),
    ]);

    let (_, _, mut events) = open_events(&app.app, "P1", "alice").await;
    assert_eq!(next_frame(&mut events).await["type"], json!("connected"));

    let status = send_status(
        &app.app,
        Method::POST,
        "/v1/projects/P1/runs",
        Some(run_body("alice", "add a footer")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let frame = next_frame(&mut events).await;
    assert_eq!(frame["type"], json!("added"));
    assert_eq!(frame["projectId"], json!("P1"));
    assert!(frame["path"]
        .as_str()
        .is_some_and(|path| path.ends_with("src/Footer.tsx")));
}

#[tokio::test]
async fn token_auth_guards_everything_but_health() {
    let app = TestApp::new_with_auth(AuthConfig::with_token("secret".to_string()));

    let status = send_status(&app.app, Method::GET, "/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, problem) = send_json(
        &app.app,
        Method::POST,
        "/v1/projects",
        Some(json!({ "projectId": "P1", "userId": "alice", "sandboxId": "sbx-1" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(problem["status"], json!(401));

    let request = Request::builder()
        .method(Method::GET)
        .uri("/v1/sandboxes/sbx-1/alive")
        .header(header::AUTHORIZATION, "Bearer secret")
        .body(Body::empty())
        .expect("alive request");
    let (status, _, payload) = send_json_request(&app.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["alive"], json!(false));
}

#[tokio::test]
async fn sandbox_lifecycle_endpoints() {
    let app = TestApp::new();
    app.project("P1", "alice", "sbx-1").await;

    let (status, liveness) =
        send_json(&app.app, Method::GET, "/v1/sandboxes/sbx-1/alive", None).await;
    assert_eq!(status, StatusCode::OK);
    insta::assert_json_snapshot!(liveness, @r###"
    {
      "alive": true
    }
    "###);

    let (status, paused) =
        send_json(&app.app, Method::POST, "/v1/sandboxes/sbx-1/pause", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(paused["sandboxId"], json!("sbx-1"));

    let (_, liveness) = send_json(&app.app, Method::GET, "/v1/sandboxes/sbx-1/alive", None).await;
    assert_eq!(liveness["alive"], json!(false));

    let (status, resumed) =
        send_json(&app.app, Method::POST, "/v1/sandboxes/sbx-1/resume", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resumed["sandboxId"], json!("sbx-1"));
    assert_eq!(resumed["workingDir"], json!(WORKING_DIR));

    let (_, liveness) = send_json(&app.app, Method::GET, "/v1/sandboxes/sbx-1/alive", None).await;
    assert_eq!(liveness["alive"], json!(true));

    let (_, liveness) = send_json(&app.app, Method::GET, "/v1/sandboxes/nope/alive", None).await;
    assert_eq!(liveness["alive"], json!(false));
    let status = send_status(&app.app, Method::POST, "/v1/sandboxes/nope/pause", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn pausing_a_paused_sandbox_keeps_it_paused() {
    let app = TestApp::new();
    app.project("P1", "alice", "sbx-1").await;
    app.backends.provider.set_status("sbx-1", SandboxStatus::Paused);
    app.backends.provider.fail_pause(true);

    let (status, paused) =
        send_json(&app.app, Method::POST, "/v1/sandboxes/sbx-1/pause", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(paused["sandboxId"], json!("sbx-1"));
    assert!(paused["caveat"].is_string(), "{paused}");

    let (_, liveness) = send_json(&app.app, Method::GET, "/v1/sandboxes/sbx-1/alive", None).await;
    assert_eq!(liveness, json!({ "alive": false, "reason": "paused" }));
    assert_eq!(
        app.services.sessions.record("sbx-1").map(|record| record.status),
        Some(SandboxStatus::Paused)
    );
}

#[tokio::test]
async fn unknown_routes_and_openapi() {
    let app = TestApp::new();
    let status = send_status(&app.app, Method::GET, "/nowhere", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, doc) = send_json(&app.app, Method::GET, "/v1/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(doc["paths"]
        .as_object()
        .is_some_and(|paths| paths.contains_key("/v1/projects/{project_id}/restore")));
}
