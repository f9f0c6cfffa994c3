//! Refinery: autonomous trading-strategy refinement
//!
//! Usage:
//!   refinery serve --port 8000                          Launch the API + WebSocket server
//!   refinery run --strategy-id strat_...                Run a refinement loop from the CLI
//!   refinery import --name X --file algo.py --project-id 123

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post, put},
    Router,
};
use clap::{Parser, Subcommand};
use engine::{
    new_id, AnthropicClient, BacktestOrchestrator, BroadcastSink, ConfigUpdate, EventEnvelope,
    EventSink, FocusMetric, IterationStore, LoopOutcome, QuantConnectClient, RefinementConfig,
    RefinementLoop, RefinementSession, SqliteStore, Strategy,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_ITERATION_LIMIT: i64 = 50;

#[derive(Parser)]
#[command(name = "refinery")]
#[command(about = "Autonomous trading strategy refinement", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the API server
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 8000)]
        port: u16,
    },
    /// Run a refinement loop from the CLI until it stops (Ctrl+C to stop early)
    Run {
        /// Strategy to refine
        #[arg(long)]
        strategy_id: String,
        /// Stop after N iterations (default: unlimited)
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Seconds between iterations
        #[arg(long)]
        cooldown: Option<u64>,
        /// Metric to improve: sharpe, drawdown, return
        #[arg(long)]
        focus: Option<String>,
        /// Improvement below which an iteration counts as a plateau
        #[arg(long)]
        threshold: Option<f64>,
        /// Keep going after consecutive plateau iterations
        #[arg(long)]
        no_auto_stop: bool,
    },
    /// Import a strategy from a source file
    Import {
        #[arg(long)]
        name: String,
        /// Path to the algorithm source
        #[arg(long)]
        file: String,
        /// QuantConnect project the strategy runs in
        #[arg(long)]
        project_id: String,
        #[arg(long)]
        description: Option<String>,
    },
}

#[derive(Clone)]
struct AppState {
    store: SqliteStore,
    events: BroadcastSink,
    session: Arc<Mutex<Option<RefinementSession>>>,
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,refinery=debug")
    } else {
        EnvFilter::new("info,engine=info,refinery=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();

    match cli.command {
        Commands::Serve { host, port } => {
            cmd_serve(&host, port).await?;
        }
        Commands::Run {
            strategy_id,
            max_iterations,
            cooldown,
            focus,
            threshold,
            no_auto_stop,
        } => {
            let focus_metric = focus
                .map(|f| f.parse::<FocusMetric>())
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let update = ConfigUpdate {
                max_iterations,
                backtest_cooldown: cooldown,
                improvement_threshold: threshold,
                focus_metric,
                auto_stop_on_plateau: no_auto_stop.then_some(false),
                ..Default::default()
            };
            cmd_run(&strategy_id, update).await?;
        }
        Commands::Import {
            name,
            file,
            project_id,
            description,
        } => {
            cmd_import(name, &file, project_id, description).await?;
        }
    }

    Ok(())
}

async fn open_store() -> anyhow::Result<(SqliteStore, String)> {
    let db_path =
        std::env::var("REFINERY_DB_PATH").unwrap_or_else(|_| "data/refinery.db".to_string());
    let db = persistence::Database::new(&db_path).await.map_err(|e| {
        error!("Failed to initialize database: {}", e);
        anyhow::anyhow!("Database initialization failed: {}", e)
    })?;
    info!("Database initialized: {}", db_path);
    Ok((SqliteStore::new(db.pool_clone()), db_path))
}

/// Wire up a loop with the QuantConnect and Anthropic clients from the environment
fn build_loop(
    store: SqliteStore,
    events: Arc<dyn EventSink>,
    config: RefinementConfig,
) -> anyhow::Result<RefinementLoop> {
    let remote = QuantConnectClient::from_env()?;
    let model = AnthropicClient::from_env()?;
    info!(model = model.model(), "Language model configured");

    Ok(RefinementLoop::new(
        BacktestOrchestrator::new(Arc::new(remote)),
        Arc::new(model),
        Arc::new(store),
        events,
        config,
    ))
}

// ============================================================================
// Serve command: Axum web server
// ============================================================================

/// REST routes under `/api` plus the event WebSocket
fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(api_health))
        .route("/strategies", get(api_list_strategies).post(api_create_strategy))
        .route("/strategies/:id", get(api_get_strategy).delete(api_delete_strategy))
        .route("/strategies/:id/code", put(api_update_code))
        .route("/loop/status", get(api_loop_status))
        .route("/loop/start", post(api_start_loop))
        .route("/loop/stop", post(api_stop_loop))
        .route("/loop/pause", post(api_pause_loop))
        .route("/loop/resume", post(api_resume_loop))
        .route("/iterations/:strategy_id", get(api_iterations))
        .route("/iterations/:strategy_id/latest", get(api_latest_iteration))
        .route("/config", get(api_get_config).put(api_update_config));

    Router::new()
        .nest("/api", api_routes)
        .route("/ws", get(ws_handler))
        .layer(cors)
        .with_state(state)
}

async fn cmd_serve(host: &str, port: u16) -> anyhow::Result<()> {
    info!("Refinery v{} starting...", APP_VERSION);
    let (store, db_path) = open_store().await?;

    let state = AppState {
        store,
        events: BroadcastSink::default(),
        session: Arc::new(Mutex::new(None)),
    };

    let app = router(state.clone());

    let addr: std::net::SocketAddr = format!("{}:{}", host, port).parse()?;
    println!("\n=== Refinery v{} ===", APP_VERSION);
    println!("Listening on http://{}", addr);
    println!("\nEndpoints:");
    println!("  GET    /api/health                     - Health check");
    println!("  GET    /api/strategies                 - List strategies");
    println!("  POST   /api/strategies                 - Create strategy");
    println!("  GET    /api/strategies/:id             - Strategy with iterations");
    println!("  PUT    /api/strategies/:id/code        - Manual code update");
    println!("  DELETE /api/strategies/:id             - Delete strategy");
    println!("  GET    /api/loop/status                - Loop status");
    println!("  POST   /api/loop/start                 - Start refinement loop");
    println!("  POST   /api/loop/stop|pause|resume     - Control the loop");
    println!("  GET    /api/iterations/:id             - Iteration history");
    println!("  GET    /api/iterations/:id/latest      - Latest iteration");
    println!("  GET    /api/config  PUT /api/config    - Loop configuration");
    println!("  GET    /ws                             - Live loop events");
    println!("\n  Database: {}", db_path);
    println!("\nPress Ctrl+C to stop\n");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    // Let a running loop finish its current step and record loop_stopped
    if let Some(session) = state.session.lock().await.take() {
        if session.is_running() {
            info!("Stopping refinement loop...");
            session.stop();
            session.wait().await;
        }
    }

    Ok(())
}

// ============================================================================
// Run command: CLI mode (no web server)
// ============================================================================

async fn cmd_run(strategy_id: &str, update: ConfigUpdate) -> anyhow::Result<()> {
    println!("\n=== Refinery v{} ===", APP_VERSION);
    let (store, db_path) = open_store().await?;

    let strategy = store
        .get_strategy(strategy_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Strategy not found: {}", strategy_id))?;

    let mut config = store.load_config().await?;
    config.apply(update);

    println!("Database: {}", db_path);
    println!(
        "Strategy: {} ({}) v{} | Project: {}",
        strategy.name,
        strategy.id,
        strategy.current_version,
        strategy.qc_project_id.as_deref().unwrap_or("none")
    );
    println!(
        "Focus: {} | Threshold: {} | Cooldown: {}s | Max iterations: {}",
        config.focus_metric,
        config.improvement_threshold,
        config.backtest_cooldown,
        config
            .max_iterations
            .map(|m| m.to_string())
            .unwrap_or_else(|| "unlimited".to_string())
    );
    println!("Press Ctrl+C to stop after the current step\n");

    let events = BroadcastSink::default();
    let mut rx = events.subscribe();
    let session = build_loop(store, Arc::new(events), config)?.spawn(strategy);

    let printer = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => print_event(&envelope),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Event printer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C received, requesting stop...");
            session.stop();
        }
        _ = wait_until_finished(&session) => {}
    }

    let outcome = session.wait().await;
    // The sink closes with the loop, so the printer drains and exits
    printer.await.ok();

    println!("\nLoop finished: {:?}", outcome);
    if let LoopOutcome::Failed(message) = outcome {
        anyhow::bail!("Refinement loop failed: {}", message);
    }
    Ok(())
}

async fn wait_until_finished(session: &RefinementSession) {
    while session.is_running() {
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    }
}

fn print_event(envelope: &EventEnvelope) {
    let data = &envelope.data;
    match envelope.event.as_str() {
        "loop_started" => println!("  Loop started for {}", data["strategy_name"]),
        "iteration_started" => println!("\n  Iteration #{} ({})", data["iteration_number"], data["iteration_id"]),
        "phase" => println!("    > {}", data["phase"].as_str().unwrap_or_default()),
        "backtest_failed" => println!("    Backtest failed: {}", data["reason"].as_str().unwrap_or_default()),
        "backtest_complete" => println!(
            "    Sharpe {:.3} | DD {:.2}% | Return {:.2}%",
            data["sharpe"].as_f64().unwrap_or_default(),
            data["max_drawdown"].as_f64().unwrap_or_default() * 100.0,
            data["total_return"].as_f64().unwrap_or_default() * 100.0
        ),
        "analysis_complete" => println!(
            "    Diagnosis: {} ({} changes)",
            data["diagnosis"].as_str().unwrap_or_default(),
            data["suggested_changes"]
        ),
        "iteration_complete" => println!(
            "    Improvement {:+.2}% -> v{}",
            data["improvement"].as_f64().unwrap_or_default() * 100.0,
            data["new_version"]
        ),
        "cooldown" => println!("    Cooling down {}s", data["seconds"]),
        "error" => println!("  Error: {}", data["message"].as_str().unwrap_or_default()),
        other => println!("  {}: {}", other, data),
    }
}

// ============================================================================
// Import command
// ============================================================================

async fn cmd_import(
    name: String,
    file: &str,
    project_id: String,
    description: Option<String>,
) -> anyhow::Result<()> {
    let code = tokio::fs::read_to_string(file)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", file, e))?;
    let (store, _) = open_store().await?;

    let mut strategy = Strategy::new(new_id("strat"), name, code);
    strategy.description = description;
    strategy.qc_project_id = Some(project_id);
    store.save_strategy(&strategy).await?;

    info!(strategy_id = %strategy.id, "Strategy imported");
    println!("Imported strategy {} ({})", strategy.name, strategy.id);
    Ok(())
}

// ============================================================================
// API Handlers: Strategies
// ============================================================================

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn api_error(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<Value>) {
    let message = message.into();
    if status.is_server_error() {
        error!("{}", message);
    }
    (status, Json(json!({ "success": false, "error": message })))
}

fn internal(context: &str) -> impl FnOnce(anyhow::Error) -> (StatusCode, Json<Value>) + '_ {
    move |e| api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{}: {:#}", context, e))
}

/// GET /api/health
async fn api_health(State(state): State<AppState>) -> Json<Value> {
    let loop_running = state
        .session
        .lock()
        .await
        .as_ref()
        .is_some_and(|s| s.is_running());

    Json(json!({
        "status": "ok",
        "service": "refinery",
        "version": APP_VERSION,
        "timestamp": chrono::Utc::now(),
        "loop_running": loop_running,
    }))
}

/// GET /api/strategies
async fn api_list_strategies(State(state): State<AppState>) -> ApiResult {
    let strategies = state
        .store
        .list_strategies()
        .await
        .map_err(internal("Failed to list strategies"))?;
    Ok(Json(json!({ "strategies": strategies })))
}

#[derive(Deserialize)]
struct CreateStrategyRequest {
    name: String,
    code: String,
    description: Option<String>,
    qc_project_id: Option<String>,
}

/// POST /api/strategies
async fn api_create_strategy(
    State(state): State<AppState>,
    Json(request): Json<CreateStrategyRequest>,
) -> ApiResult {
    let mut strategy = Strategy::new(new_id("strat"), request.name, request.code);
    strategy.description = request.description;
    strategy.qc_project_id = request.qc_project_id;

    state
        .store
        .save_strategy(&strategy)
        .await
        .map_err(internal("Failed to save strategy"))?;
    info!(strategy_id = %strategy.id, name = %strategy.name, "Strategy created");
    Ok(Json(json!({ "strategy": strategy })))
}

async fn find_strategy(state: &AppState, id: &str) -> Result<Strategy, (StatusCode, Json<Value>)> {
    state
        .store
        .get_strategy(id)
        .await
        .map_err(internal("Failed to load strategy"))?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Strategy not found"))
}

/// GET /api/strategies/:id: strategy with its iteration history
async fn api_get_strategy(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let strategy = find_strategy(&state, &id).await?;
    let iterations = state
        .store
        .recent_iterations(&id, DEFAULT_ITERATION_LIMIT as usize)
        .await
        .map_err(internal("Failed to load iterations"))?;
    Ok(Json(json!({ "strategy": strategy, "iterations": iterations })))
}

#[derive(Deserialize)]
struct UpdateCodeRequest {
    code: String,
}

/// PUT /api/strategies/:id/code: manual edit, bumps the version
async fn api_update_code(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateCodeRequest>,
) -> ApiResult {
    let mut strategy = find_strategy(&state, &id).await?;
    strategy.code = request.code;
    strategy.current_version += 1;

    state
        .store
        .save_strategy(&strategy)
        .await
        .map_err(internal("Failed to save strategy"))?;
    info!(strategy_id = %id, version = strategy.current_version, "Strategy code updated");
    Ok(Json(json!({ "strategy": strategy })))
}

/// DELETE /api/strategies/:id
async fn api_delete_strategy(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    if let Some(session) = state.session.lock().await.as_ref() {
        if session.is_running() && session.strategy_id() == id {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "Strategy is being refined. Stop the loop first.",
            ));
        }
    }

    let deleted = state
        .store
        .delete_strategy(&id)
        .await
        .map_err(internal("Failed to delete strategy"))?;
    if !deleted {
        return Err(api_error(StatusCode::NOT_FOUND, "Strategy not found"));
    }
    Ok(Json(json!({ "success": true, "deleted": id })))
}

// ============================================================================
// API Handlers: Refinement loop
// ============================================================================

/// GET /api/loop/status
async fn api_loop_status(State(state): State<AppState>) -> Json<Value> {
    let guard = state.session.lock().await;
    let Some(session) = guard.as_ref() else {
        return Json(json!({ "status": "stopped", "current_strategy": null }));
    };

    let loop_state = session.state();
    let status = if !session.is_running() {
        "stopped"
    } else if loop_state.paused {
        "paused"
    } else {
        "running"
    };

    Json(json!({
        "status": status,
        "current_strategy": loop_state.current_strategy_id,
        "current_iteration": loop_state.iteration_count,
        "last_update": loop_state.last_update,
        "last_error": loop_state.last_error,
        "config": session.config().get(),
    }))
}

#[derive(Deserialize)]
struct StartLoopRequest {
    strategy_id: String,
    config: Option<RefinementConfig>,
}

/// POST /api/loop/start
async fn api_start_loop(
    State(state): State<AppState>,
    Json(request): Json<StartLoopRequest>,
) -> ApiResult {
    let strategy = find_strategy(&state, &request.strategy_id).await?;

    let mut guard = state.session.lock().await;
    if guard.as_ref().is_some_and(|s| s.is_running()) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Loop already running. Stop it first.",
        ));
    }
    if strategy.qc_project_id.is_none() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Strategy has no QuantConnect project",
        ));
    }

    let config = match request.config {
        Some(config) => config,
        None => state
            .store
            .load_config()
            .await
            .map_err(internal("Failed to load config"))?,
    };

    let events: Arc<dyn EventSink> = Arc::new(state.events.clone());
    let refinement = build_loop(state.store.clone(), events, config).map_err(|e| {
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Cannot start loop: {:#}", e),
        )
    })?;

    info!(strategy_id = %strategy.id, name = %strategy.name, "Starting refinement loop");
    *guard = Some(refinement.spawn(strategy));

    Ok(Json(json!({ "status": "started", "strategy_id": request.strategy_id })))
}

/// POST /api/loop/stop
async fn api_stop_loop(State(state): State<AppState>) -> ApiResult {
    let guard = state.session.lock().await;
    match guard.as_ref() {
        Some(session) if session.is_running() => {
            session.stop();
            Ok(Json(json!({ "status": "stopping" })))
        }
        _ => Err(api_error(StatusCode::BAD_REQUEST, "No loop running")),
    }
}

/// POST /api/loop/pause
async fn api_pause_loop(State(state): State<AppState>) -> ApiResult {
    let guard = state.session.lock().await;
    match guard.as_ref() {
        Some(session) if session.is_running() => {
            session.pause();
            Ok(Json(json!({ "status": "paused" })))
        }
        _ => Err(api_error(StatusCode::BAD_REQUEST, "No loop running")),
    }
}

/// POST /api/loop/resume
async fn api_resume_loop(State(state): State<AppState>) -> ApiResult {
    let guard = state.session.lock().await;
    match guard.as_ref() {
        Some(session) => {
            session.resume();
            Ok(Json(json!({ "status": "resumed" })))
        }
        None => Err(api_error(StatusCode::BAD_REQUEST, "No loop to resume")),
    }
}

// ============================================================================
// API Handlers: Iterations
// ============================================================================

#[derive(Deserialize)]
struct IterationsQuery {
    limit: Option<i64>,
}

/// GET /api/iterations/:strategy_id?limit=50
async fn api_iterations(
    State(state): State<AppState>,
    Path(strategy_id): Path<String>,
    Query(params): Query<IterationsQuery>,
) -> ApiResult {
    let limit = params.limit.unwrap_or(DEFAULT_ITERATION_LIMIT).max(0) as usize;
    let iterations = state
        .store
        .recent_iterations(&strategy_id, limit)
        .await
        .map_err(internal("Failed to load iterations"))?;
    Ok(Json(json!({ "iterations": iterations })))
}

/// GET /api/iterations/:strategy_id/latest
async fn api_latest_iteration(
    State(state): State<AppState>,
    Path(strategy_id): Path<String>,
) -> ApiResult {
    let iteration = state
        .store
        .latest_iteration(&strategy_id)
        .await
        .map_err(internal("Failed to load iteration"))?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "No iterations found"))?;
    Ok(Json(json!({ "iteration": iteration })))
}

// ============================================================================
// API Handlers: Config
// ============================================================================

/// GET /api/config
async fn api_get_config(State(state): State<AppState>) -> ApiResult {
    let config = state
        .store
        .load_config()
        .await
        .map_err(internal("Failed to load config"))?;
    Ok(Json(json!({ "config": config })))
}

/// PUT /api/config: merge, persist, and push into a running loop
async fn api_update_config(
    State(state): State<AppState>,
    Json(update): Json<ConfigUpdate>,
) -> ApiResult {
    let mut config = state
        .store
        .load_config()
        .await
        .map_err(internal("Failed to load config"))?;
    config.apply(update);

    state
        .store
        .save_config(&config)
        .await
        .map_err(internal("Failed to save config"))?;

    if let Some(session) = state.session.lock().await.as_ref() {
        session.config().replace(config.clone());
        info!("Config pushed to running loop");
    }

    Ok(Json(json!({ "config": config })))
}

// ============================================================================
// WebSocket: live loop events
// ============================================================================

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let rx = state.events.subscribe();
    ws.on_upgrade(move |socket| forward_events(socket, rx))
}

/// Push every loop event to the client; answer "ping" with "pong"
async fn forward_events(mut socket: WebSocket, mut rx: broadcast::Receiver<EventEnvelope>) {
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(envelope) => {
                    let text = match serde_json::to_string(&envelope) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to serialize event: {}", e);
                            continue;
                        }
                    };
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "WebSocket client lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) if text == "ping" => {
                    if socket.send(Message::Text("pong".to_string())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}
