use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use sandbox_studio::config::StudioConfig;
use sandbox_studio::router::{build_router_with_state, AppState, AuthConfig};
use sandbox_studio::services::{MemoryBackends, StudioServices};

const WORKING_DIR: &str = "/home/user/app";

struct TestApp {
    app: Router,
    services: Arc<StudioServices>,
    backends: MemoryBackends,
}

impl TestApp {
    fn new() -> Self {
        Self::with_config(AuthConfig::disabled(), StudioConfig::in_memory())
    }

    fn new_with_auth(auth: AuthConfig) -> Self {
        Self::with_config(auth, StudioConfig::in_memory())
    }

    fn with_config(auth: AuthConfig, config: StudioConfig) -> Self {
        let (services, backends) = StudioServices::in_memory(&config).expect("memory services");
        let state = Arc::new(AppState::new(auth, services));
        let (app, state) = build_router_with_state(state);
        Self {
            app,
            services: state.services(),
            backends,
        }
    }

    /// Creates the sandbox and registers `project_id` on it for `user_id`.
    async fn project(&self, project_id: &str, user_id: &str, sandbox_id: &str) {
        self.backends.provider.add_sandbox(sandbox_id, WORKING_DIR);
        let (status, payload) = send_json(
            &self.app,
            Method::POST,
            "/v1/projects",
            Some(json!({
                "projectId": project_id,
                "userId": user_id,
                "sandboxId": sandbox_id,
                "workingDir": WORKING_DIR,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "register project: {payload}");
    }

    fn write_file(&self, sandbox_id: &str, relative: &str, contents: &str) {
        self.backends
            .provider
            .put_file(sandbox_id, &format!("{WORKING_DIR}/{relative}"), contents);
    }

    fn read_file(&self, sandbox_id: &str, relative: &str) -> Option<String> {
        self.backends
            .provider
            .file(sandbox_id, &format!("{WORKING_DIR}/{relative}"))
            .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
    }

    async fn commit(&self, project_id: &str, user_id: &str, message: &str) -> Value {
        let (status, payload) = send_json(
            &self.app,
            Method::POST,
            &format!("/v1/projects/{project_id}/versions"),
            Some(json!({ "userId": user_id, "message": message })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "create version: {payload}");
        payload
    }
}

async fn send_json(app: &Router, method: Method, path: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    let body = if let Some(body) = body {
        builder = builder.header("content-type", "application/json");
        Body::from(body.to_string())
    } else {
        Body::empty()
    };
    let request = builder.body(body).expect("request");
    let (status, _headers, value) = send_json_request(app, request).await;
    (status, value)
}

async fn send_request(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request handled");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    (status, headers, bytes)
}

async fn send_json_request(
    app: &Router,
    request: Request<Body>,
) -> (StatusCode, HeaderMap, Value) {
    let (status, headers, bytes) = send_request(app, request).await;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or(Value::String(String::from_utf8_lossy(&bytes).to_string()))
    };
    (status, headers, value)
}

async fn send_status(app: &Router, method: Method, path: &str, body: Option<Value>) -> StatusCode {
    let (status, _) = send_json(app, method, path, body).await;
    status
}

/// Reads one `data:` frame from an event stream body.
async fn next_frame(body: &mut Body) -> Value {
    let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
        .await
        .expect("frame before timeout")
        .expect("stream open")
        .expect("frame ok");
    let data = frame.into_data().expect("data frame");
    let text = String::from_utf8_lossy(&data).to_string();
    let json = text
        .strip_prefix("data: ")
        .and_then(|rest| rest.strip_suffix("\n\n"))
        .unwrap_or_else(|| panic!("unexpected frame {text:?}"));
    serde_json::from_str(json).expect("frame json")
}

async fn open_events(app: &Router, project_id: &str, user_id: &str) -> (StatusCode, HeaderMap, Body) {
    let request = Request::builder()
        .method(Method::GET)
        .uri(format!("/v1/projects/{project_id}/events?userId={user_id}"))
        .body(Body::empty())
        .expect("events request");
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request handled");
    let status = response.status();
    let headers = response.headers().clone();
    (status, headers, response.into_body())
}
