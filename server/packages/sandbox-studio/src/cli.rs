use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use sandbox_studio_error::SandboxError;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use axum::http::{header, HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{debug, info, warn};

use crate::config::{collect_agent_env, Backend, StudioConfig, AGENT_ENV_PASSTHROUGH};
use crate::executor::RunContext;
use crate::projects::Project;
use crate::router::{build_router_with_state, AppState, AuthConfig};
use crate::run_spec::{resolve_tokens, FieldKind, ResolverDefaults, FIELDS};
use crate::services::StudioServices;
use crate::telemetry::init_logging;

/// Keep-alive comment interval for open event streams.
const EVENT_STREAM_PING: Duration = Duration::from_secs(15);

const CORS_MAX_AGE: Duration = Duration::from_secs(600);

#[derive(Parser, Debug)]
#[command(name = "sandbox-studio")]
#[command(about = "Runs coding agents inside remote sandboxes and versions their work", version)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API.
    Server(ServerArgs),
    /// Run the agent once against a sandbox and print its messages.
    Run(RunArgs),
    /// Resolve `key=value` run arguments and print the result.
    Resolve(ResolveArgs),
    /// List the accepted run arguments.
    Fields,
}

#[derive(Args, Debug)]
struct ServerArgs {
    #[arg(long, default_value = "127.0.0.1", env = "SANDBOX_STUDIO_HOST")]
    host: String,

    #[arg(long, default_value_t = 2470, env = "SANDBOX_STUDIO_PORT")]
    port: u16,

    #[arg(long, env = "SANDBOX_STUDIO_TOKEN")]
    token: Option<String>,

    #[arg(long)]
    no_token: bool,

    #[command(flatten)]
    cors: CorsArgs,

    /// Sandbox ids to pre-create with `--backend memory`.
    #[arg(long = "memory-sandbox")]
    memory_sandboxes: Vec<String>,

    #[command(flatten)]
    backend: BackendArgs,
}

/// Cross-origin access for the browser studio UI. Off unless an origin is given.
#[derive(Args, Debug, Clone, Default)]
struct CorsArgs {
    /// Origin allowed to call the API, or `*`. Repeatable.
    #[arg(long = "allow-origin", env = "SANDBOX_STUDIO_ALLOWED_ORIGINS", value_delimiter = ',')]
    origins: Vec<String>,

    /// Let the browser send credentials with cross-origin requests.
    #[arg(long = "allow-credentials")]
    credentials: bool,
}

impl CorsArgs {
    fn layer(&self) -> Result<Option<CorsLayer>, CliError> {
        if self.origins.is_empty() {
            return Ok(None);
        }
        let origin = if self.origins.iter().any(|origin| origin == "*") {
            if self.credentials {
                return Err(CliError::InvalidCors(
                    "`*` cannot be combined with --allow-credentials".to_string(),
                ));
            }
            AllowOrigin::any()
        } else {
            let origins = self
                .origins
                .iter()
                .map(|origin| {
                    origin
                        .parse::<HeaderValue>()
                        .map_err(|_| CliError::InvalidCors(format!("origin {origin:?}")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            AllowOrigin::list(origins)
        };
        Ok(Some(
            CorsLayer::new()
                .allow_origin(origin)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([
                    header::AUTHORIZATION,
                    header::CONTENT_TYPE,
                    HeaderName::from_static("last-event-id"),
                ])
                .expose_headers([header::LOCATION])
                .allow_credentials(self.credentials)
                .max_age(CORS_MAX_AGE),
        ))
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long)]
    sandbox: String,

    #[arg(long)]
    project: String,

    #[arg(long, default_value = "local")]
    user: String,

    /// Run arguments as `key=value`, e.g. `prompt="add a footer"`.
    #[arg(required = true)]
    tokens: Vec<String>,

    #[command(flatten)]
    backend: BackendArgs,
}

#[derive(Args, Debug)]
struct ResolveArgs {
    #[arg(long, default_value = "/home/user/app", env = "SANDBOX_STUDIO_DEFAULT_CWD")]
    default_cwd: String,

    tokens: Vec<String>,
}

#[derive(Args, Debug, Clone)]
struct BackendArgs {
    #[arg(long, value_enum, default_value = "http", env = "SANDBOX_STUDIO_BACKEND")]
    backend: Backend,

    #[arg(long, env = "SANDBOX_STUDIO_SANDBOX_API_URL")]
    sandbox_api_url: Option<String>,

    #[arg(long, env = "SANDBOX_STUDIO_SANDBOX_API_KEY", hide_env_values = true)]
    sandbox_api_key: Option<String>,

    #[arg(long, env = "SANDBOX_STUDIO_OBJECT_STORE_URL")]
    object_store_url: Option<String>,

    /// Base url clients fetch uploaded objects from, if it differs from the upload url.
    #[arg(long, env = "SANDBOX_STUDIO_OBJECT_STORE_PUBLIC_URL")]
    object_store_public_url: Option<String>,

    #[arg(long, env = "SANDBOX_STUDIO_OBJECT_STORE_TOKEN", hide_env_values = true)]
    object_store_token: Option<String>,

    #[arg(long, env = "SANDBOX_STUDIO_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 30, env = "SANDBOX_STUDIO_HEARTBEAT_INTERVAL_SECS")]
    heartbeat_interval_secs: u64,

    #[arg(long, default_value_t = 3, env = "SANDBOX_STUDIO_MISSED_TICKS")]
    missed_ticks: u32,

    #[arg(long, default_value = "claude", env = "SANDBOX_STUDIO_RUNNER")]
    runner_command: String,

    #[arg(long, env = "SANDBOX_STUDIO_DEFAULT_MODEL")]
    default_model: Option<String>,

    #[arg(long, env = "SANDBOX_STUDIO_DEPLOY_COMMAND")]
    deploy_command: Option<String>,

    #[arg(long, env = "SANDBOX_STUDIO_DEPLOY_TIMEOUT_SECS")]
    deploy_timeout_secs: Option<u64>,

    /// Command run in the sandbox when a run ends, before deploy and
    /// checkpoint. Repeatable; the env form takes one command per line.
    #[arg(long = "session-end-hook", env = "SANDBOX_STUDIO_SESSION_END_HOOKS", value_delimiter = '\n')]
    session_end_hooks: Vec<String>,

    /// Command run in the sandbox when a run is cancelled. Repeatable; the
    /// env form takes one command per line.
    #[arg(long = "cancelled-hook", env = "SANDBOX_STUDIO_CANCELLED_HOOKS", value_delimiter = '\n')]
    cancelled_hooks: Vec<String>,

    #[arg(long, env = "SANDBOX_STUDIO_BUILD_COMMAND")]
    build_command: Option<String>,

    #[arg(long, env = "SANDBOX_STUDIO_BUNDLE_OUTPUT_DIR")]
    bundle_output_dir: Option<String>,

    /// Build and publish a bundle with every end-of-run checkpoint.
    #[arg(long)]
    bundle_on_checkpoint: bool,

    /// Skip the end-of-run checkpoint.
    #[arg(long)]
    no_checkpoint: bool,

    #[arg(long, default_value = "/home/user/app", env = "SANDBOX_STUDIO_DEFAULT_CWD")]
    default_cwd: String,
}

impl BackendArgs {
    fn to_config(&self) -> StudioConfig {
        let mut config = match self.backend {
            Backend::Http => StudioConfig::default(),
            Backend::Memory => StudioConfig::in_memory(),
        }
        .with_heartbeat(
            Duration::from_secs(self.heartbeat_interval_secs),
            self.missed_ticks,
        );
        config.sandbox_api_url = self.sandbox_api_url.clone();
        config.sandbox_api_key = self.sandbox_api_key.clone();
        config.object_store_url = self.object_store_url.clone();
        config.object_store_public_url = self.object_store_public_url.clone();
        config.object_store_token = self.object_store_token.clone();
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        config.runner_command = self.runner_command.clone();
        if self.default_model.is_some() {
            config.executor.default_model = self.default_model.clone();
        }
        config.executor.agent_env = collect_agent_env(AGENT_ENV_PASSTHROUGH);
        if let Some(command) = &self.build_command {
            config.checkpoint.build_command = command.clone();
        }
        if let Some(dir) = &self.bundle_output_dir {
            config.checkpoint.bundle_output_dir = dir.clone();
        }
        config.hooks.deploy_command = self.deploy_command.clone();
        config.hooks.deploy_timeout_secs = self.deploy_timeout_secs;
        config.hooks.session_end_commands = non_blank(&self.session_end_hooks);
        config.hooks.cancelled_commands = non_blank(&self.cancelled_hooks);
        config.hooks.checkpoint_on_success = !self.no_checkpoint;
        config.hooks.bundle_on_checkpoint = self.bundle_on_checkpoint;
        config.resolver = ResolverDefaults {
            cwd: self.default_cwd.clone(),
        };
        config
    }
}

fn non_blank(commands: &[String]) -> Vec<String> {
    commands
        .iter()
        .map(|command| command.trim())
        .filter(|command| !command.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("missing --token or --no-token for server mode")]
    MissingToken,
    #[error("invalid cors configuration: {0}")]
    InvalidCors(String),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
    #[error("run finished as {0}")]
    RunFailed(String),
}

pub fn run_sandbox_studio() -> Result<(), CliError> {
    let cli = Cli::parse();
    init_logging();
    match &cli.command {
        Command::Server(args) => run_server(args),
        Command::Run(args) => run_once(args),
        Command::Resolve(args) => resolve(args),
        Command::Fields => print_fields(),
    }
}

fn build_runtime() -> Result<tokio::runtime::Runtime, CliError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))
}

fn run_server(args: &ServerArgs) -> Result<(), CliError> {
    let auth = if args.no_token {
        AuthConfig::disabled()
    } else if let Some(token) = args.token.clone() {
        AuthConfig::with_token(token)
    } else {
        return Err(CliError::MissingToken);
    };

    let config = args.backend.to_config();
    let cors = args.cors.layer()?;
    let addr = format!("{}:{}", args.host, args.port);
    let runtime = build_runtime()?;

    runtime.block_on(async move {
        let services = match config.backend {
            Backend::Http => StudioServices::from_config(&config)?,
            Backend::Memory => {
                let (services, backends) = StudioServices::in_memory(&config)?;
                for sandbox_id in &args.memory_sandboxes {
                    backends.provider.add_sandbox(sandbox_id, &config.resolver.cwd);
                }
                services
            }
        };
        let (mut router, state) =
            build_router_with_state(Arc::new(AppState::new(auth, services)));
        if let Some(cors) = cors {
            router = router.layer(cors);
        }

        let broadcaster = state.services().broadcaster.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EVENT_STREAM_PING);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let dropped = broadcaster.ping_all();
                if dropped > 0 {
                    debug!(dropped, "reaped event stream connections");
                }
            }
        });

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(addr = %addr, "sandbox-studio listening");
        axum::serve(listener, router)
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn run_once(args: &RunArgs) -> Result<(), CliError> {
    let config = args.backend.to_config();
    let runtime = build_runtime()?;

    runtime.block_on(async move {
        let services = match config.backend {
            Backend::Http => StudioServices::from_config(&config)?,
            Backend::Memory => {
                let (services, backends) = StudioServices::in_memory(&config)?;
                backends
                    .provider
                    .add_sandbox(&args.sandbox, &config.resolver.cwd);
                services
            }
        };

        let spec = resolve_tokens(&args.tokens, &services.resolver)?;
        let project = services.projects.register(Project {
            project_id: args.project.clone(),
            owner_id: args.user.clone(),
            sandbox_id: args.sandbox.clone(),
            working_dir: spec.cwd.clone(),
        })?;
        let hooks = services.hooks_for(&spec)?;
        let ctx = RunContext {
            run_id: format!("cli_{:x}", crate::now_unix_ms()),
            project_id: project.project_id,
            sandbox_id: project.sandbox_id,
            working_dir: project.working_dir,
            spec,
            hooks,
        };

        let cancel = CancellationToken::new();
        let interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted; cancelling run");
                interrupt.cancel();
            }
        });

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let printer = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(err) => warn!(error = %err, "failed to encode run event"),
                }
            }
        });

        let outcome = services.executor.run(ctx, cancel, Some(events_tx)).await;
        if let Err(err) = printer.await {
            warn!(error = %err, "event printer stopped");
        }
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        if outcome.success {
            Ok(())
        } else {
            Err(CliError::RunFailed(outcome.state.as_str().to_string()))
        }
    })
}

fn resolve(args: &ResolveArgs) -> Result<(), CliError> {
    let defaults = ResolverDefaults {
        cwd: args.default_cwd.clone(),
    };
    let spec = resolve_tokens(&args.tokens, &defaults)?;
    println!("{}", serde_json::to_string_pretty(&spec)?);
    Ok(())
}

fn print_fields() -> Result<(), CliError> {
    for field in FIELDS {
        let kind = match field.kind {
            FieldKind::Text => "string",
            FieldKind::Path => "path",
            FieldKind::JsonList => "json-list",
            FieldKind::Bool => "bool",
        };
        let required = if field.required { "required" } else { "optional" };
        if field.default.is_empty() {
            println!("{:<18} {:<10} {}", field.name, kind, required);
        } else {
            println!(
                "{:<18} {:<10} {} (default: {})",
                field.name, kind, required, field.default
            );
        }
    }
    Ok(())
}
