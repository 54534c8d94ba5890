use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

mod agent_client;
mod catalog;
mod config;
mod executor;
mod fallback;
mod llm;
mod matcher;
mod plan;
mod router;
mod schema;
mod stream;

use agent_client::GatewayAgentClient;
use catalog::AgentCatalog;
use config::SystemConfig;
use executor::{build_profile, FilePackSource, PackSource};
use fallback::FallbackClassifier;
use llm::{ChatTurn, GatewayClient, GenerationService};
use plan::PlanGenerator;
use router::{HybridRouter, RuleRouter};
use stream::StreamDeps;

const MAX_INPUT_LEN: usize = 2000;
const EVENT_RING_CAP: usize = 200;

struct App {
    config: SystemConfig,
    catalog: Arc<AgentCatalog>,
    router: HybridRouter,
    deps: Arc<StreamDeps>,
    packs: Arc<dyn PackSource>,
    events: Mutex<VecDeque<String>>,
}

impl App {
    async fn log_event(&self, msg: String) {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut events = self.events.lock().await;
        if events.len() >= EVENT_RING_CAP {
            events.pop_front();
        }
        events.push_back(format!("[{}] {}", ts, msg));
    }
}

#[derive(Deserialize)]
struct AskReq {
    message: String,
    #[serde(default)]
    history: Vec<ChatTurn>,
}

#[derive(Serialize)]
struct ErrRes {
    error: String,
}

#[derive(Serialize)]
struct StatusRes {
    version: String,
    agents: usize,
    total_games: u32,
    events: usize,
    ready: bool,
}

#[derive(Serialize)]
struct EventsRes {
    events: Vec<String>,
}

#[tokio::main]
async fn main() {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config_path =
        std::env::var("RIFT_COACH_CONFIG").unwrap_or_else(|_| "./rift_coach.json".into());
    let config = match SystemConfig::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            log::warn!("{}，使用默认配置", e);
            SystemConfig::default()
        }
    };
    log::info!("RIFT COACH v{} 启动", config.version);

    let app = match build_app(config) {
        Ok(app) => Arc::new(app),
        Err(e) => {
            eprintln!("初始化失败: {}", e);
            std::process::exit(1);
        }
    };

    let router = Router::new()
        .route("/api/ask", post(ask))
        .route("/api/route", post(route_debug))
        .route("/api/agents", get(agents))
        .route("/api/metrics", get(metrics))
        .route("/api/status", get(status))
        .route("/api/events", get(events))
        .with_state(app);

    let addr = std::env::var("RIFT_COACH_ADDR").unwrap_or_else(|_| "127.0.0.1:3000".into());
    log::info!("http://{}", addr);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("端口绑定失败: {}", e);
            std::process::exit(1);
        }
    };
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
        .ok();
}

fn build_app(config: SystemConfig) -> Result<App, String> {
    let catalog = Arc::new(AgentCatalog::load(config.catalog_path.as_deref()));
    let service: Arc<dyn GenerationService> = Arc::new(GatewayClient::new(
        &config.gateway.base_url,
        config.gateway.timeout_secs,
    )?);
    let invoker = Arc::new(GatewayAgentClient::new(
        &config.gateway.base_url,
        config.gateway.timeout_secs,
    )?);
    let packs: Arc<dyn PackSource> = Arc::new(FilePackSource::new(&config.packs_dir));

    let rule = RuleRouter::new(catalog.clone(), config.routing.rule_threshold);
    let fallback = FallbackClassifier::new(
        catalog.clone(),
        service.clone(),
        &config.routing.default_agent,
        config.routing.context_turns,
        config.gateway.max_output_tokens,
    );
    let router = HybridRouter::new(rule, fallback);

    let deps = Arc::new(StreamDeps {
        generator: PlanGenerator::new(service.clone(), config.gateway.max_output_tokens),
        narrator: service,
        invoker,
        packs: packs.clone(),
        narrate_max_tokens: config.gateway.max_output_tokens,
    });

    Ok(App {
        config,
        catalog,
        router,
        deps,
        packs,
        events: Mutex::new(VecDeque::new()),
    })
}

/// 截到字符边界，避免把多字节字符劈成两半。
fn truncate_input(message: &str) -> &str {
    if message.len() <= MAX_INPUT_LEN {
        return message;
    }
    let mut end = MAX_INPUT_LEN;
    while !message.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    &message[..end]
}

async fn ask(State(app): State<Arc<App>>, Json(req): Json<AskReq>) -> Response {
    let query = truncate_input(&req.message).trim().to_string();
    if query.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrRes { error: "message 不能为空".into() }),
        )
            .into_response();
    }

    let profile = build_profile(app.packs.as_ref()).ok().map(|p| p.summary());
    let result = app
        .router
        .route(&query, &req.history, profile.as_deref())
        .await;
    app.log_event(format!(
        "ASK {:?} → {:?} {} ({:.2})",
        result.routing_method,
        result.decision.action,
        result.decision.subagent_id.as_deref().unwrap_or("-"),
        result.decision.confidence,
    ))
    .await;

    let (tx, rx) = mpsc::channel::<String>(32);
    let deps = app.deps.clone();
    let decision = result.decision;
    tokio::spawn(async move {
        stream::run(&query, &decision, &deps, tx).await;
    });

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>));
    (
        [(header::CONTENT_TYPE, "application/x-ndjson; charset=utf-8")],
        body,
    )
        .into_response()
}

/// 只路由不执行，给调试和评估用。
async fn route_debug(State(app): State<Arc<App>>, Json(req): Json<AskReq>) -> Response {
    let query = truncate_input(&req.message).trim().to_string();
    if query.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrRes { error: "message 不能为空".into() }),
        )
            .into_response();
    }
    let profile = build_profile(app.packs.as_ref()).ok().map(|p| p.summary());
    let result = app
        .router
        .route(&query, &req.history, profile.as_deref())
        .await;
    app.log_event(format!(
        "ROUTE {:?} → {:?} ({:.2})",
        result.routing_method, result.decision.action, result.decision.confidence
    ))
    .await;
    Json(result).into_response()
}

async fn agents(State(app): State<Arc<App>>) -> Json<Vec<catalog::AgentMetadata>> {
    Json(app.catalog.all().to_vec())
}

async fn metrics() -> Json<&'static [catalog::MetricDef]> {
    Json(catalog::METRICS)
}

async fn status(State(app): State<Arc<App>>) -> Json<StatusRes> {
    let total_games = build_profile(app.packs.as_ref())
        .map(|p| p.total_games)
        .unwrap_or(0);
    let events = app.events.lock().await.len();
    Json(StatusRes {
        version: app.config.version.clone(),
        agents: app.catalog.count(),
        total_games,
        events,
        ready: true,
    })
}

async fn events(State(app): State<Arc<App>>) -> Json<EventsRes> {
    let events = app.events.lock().await;
    Json(EventsRes { events: events.iter().cloned().collect() })
}
