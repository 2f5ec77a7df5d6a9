mod config;
mod error;
mod formatter;
mod models;
mod relay;

use anyhow::Context;
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, header::CONTENT_TYPE},
    routing::{get, post},
};
use chrono::Utc;
use clap::Parser;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tracing::{Instrument, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use config::RelayConfig;
use error::RelayError;
use models::{bitrix_api::BitrixClient, freshdesk};
use relay::{Relay, RelayOutcome};

const SECRET_HEADER: &str = "x-shared-secret";

type HmacSha256 = Hmac<Sha256>;

/// ----------------------------------------------------------------------
/// 1  Command line / environment
/// ----------------------------------------------------------------------
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Bitrix24 inbound webhook base URL (https://<portal>/rest/<user>/<token>)
    #[arg(long, env = "BITRIX_WEBHOOK_URL")]
    bitrix_url: String,

    /// Bitrix24 user that owns created tasks
    #[arg(long, env = "DEFAULT_RESPONSIBLE_ID")]
    responsible_id: u64,

    /// Co-responsible users, comma separated
    #[arg(long, env = "BITRIX_ACCOMPLICES", value_delimiter = ',')]
    accomplices: Vec<u64>,

    /// Auditors, comma separated
    #[arg(long, env = "BITRIX_AUDITORS", value_delimiter = ',')]
    auditors: Vec<u64>,

    /// Days until the task deadline
    #[arg(long, env = "DEADLINE_DAYS", default_value_t = 3)]
    deadline_days: i64,

    /// Attempts per task creation before giving up
    #[arg(long, env = "MAX_RETRIES", default_value_t = 3)]
    max_attempts: u32,

    /// Pause between attempts
    #[arg(long, env = "RETRY_DELAY_MS", default_value_t = 0)]
    retry_delay_ms: u64,

    /// Timeout of every outbound call
    #[arg(long, env = "HTTP_TIMEOUT_SECS", default_value_t = 15)]
    timeout_secs: u64,

    /// Bitrix24 STATUS of created tasks (2 = pending)
    #[arg(long, env = "BITRIX_TASK_STATUS", default_value_t = 2)]
    task_status: u8,

    /// Bitrix24 PRIORITY when the ticket has none (0 low, 1 normal, 2 high)
    #[arg(long, env = "BITRIX_DEFAULT_PRIORITY", default_value_t = 1)]
    default_priority: u8,

    /// Upload ticket attachments into this Drive folder
    #[arg(long, env = "BITRIX_UPLOAD_FOLDER_ID")]
    upload_folder_id: Option<u64>,

    /// Notify this user about every created task
    #[arg(long, env = "BITRIX_NOTIFY_USER_ID")]
    notify_user_id: Option<u64>,

    /// Required value of the X-Shared-Secret header
    #[arg(long, env = "SHARED_SECRET", hide_env_values = true)]
    shared_secret: Option<String>,

    /// Port (Default 3000)
    #[arg(short, long, env = "PORT", default_value_t = 3000)]
    port: u16,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<RelayConfig> {
        let mut config = RelayConfig::new(self.bitrix_url, self.responsible_id);
        config.accomplices = self.accomplices;
        config.auditors = self.auditors;
        config.deadline_days = self.deadline_days;
        config.max_attempts = self.max_attempts;
        config.retry_delay = Duration::from_millis(self.retry_delay_ms);
        config.timeout = Duration::from_secs(self.timeout_secs);
        config.task_status = self.task_status.try_into().map_err(anyhow::Error::msg)?;
        config.default_priority = self
            .default_priority
            .try_into()
            .map_err(anyhow::Error::msg)?;
        config.upload_folder_id = self.upload_folder_id;
        config.notify_user_id = self.notify_user_id;
        config.shared_secret = self.shared_secret;
        config.validate()
    }
}

/// ----------------------------------------------------------------------
/// 2  Shared app state
/// ----------------------------------------------------------------------
struct AppState {
    relay: Arc<Relay>,
}

fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/relay", post(relay_webhook).fallback(method_not_allowed))
        .route("/freshdesk", post(relay_webhook).fallback(method_not_allowed))
        .with_state(state)
}

/// ----------------------------------------------------------------------
/// 3  Startup
/// ----------------------------------------------------------------------
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // a) .env and logging
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            return Err(e).context("failed to read .env");
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // b) CLI
    let cli = Cli::parse();
    let port = cli.port;
    let config = cli.into_config().context("invalid configuration")?;

    // c) destination client and state
    let client = reqwest::Client::builder()
        .timeout(config.timeout)
        .build()
        .context("failed to build HTTP client")?;
    let destination = Arc::new(BitrixClient::new(client, config.bitrix_url.clone()));
    if config.shared_secret.is_none() {
        warn!("SHARED_SECRET is not set, the relay accepts unauthenticated requests");
    }
    let state = Arc::new(AppState {
        relay: Arc::new(Relay::new(config, destination)),
    });

    // d) server
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Listening on http://{addr}/{{relay, freshdesk}}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app(state))
        .await
        .context("server error")?;
    Ok(())
}

/// ----------------------------------------------------------------------
/// 4  Handlers
/// ----------------------------------------------------------------------
async fn health() -> &'static str {
    "Freshdesk -> Bitrix24 relay is running."
}

async fn method_not_allowed() -> RelayError {
    RelayError::MethodNotAllowed
}

#[tracing::instrument(skip_all, fields(request_id = %Uuid::new_v4(), ticket_id))]
async fn relay_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<RelayOutcome>, RelayError> {
    authorize(state.relay.config(), &headers)?;

    let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
    let payload = freshdesk::decode_body(content_type, &body)?;

    // Detached so a client hanging up does not abort a half-done delivery.
    let relay = Arc::clone(&state.relay);
    tokio::spawn(async move { relay.handle(payload, Utc::now()).await }.in_current_span())
        .await
        .map_err(|e| RelayError::Internal(format!("relay task failed: {e}")))?
        .map(Json)
}

fn authorize(config: &RelayConfig, headers: &HeaderMap) -> Result<(), RelayError> {
    let Some(expected) = config.shared_secret.as_deref() else {
        return Ok(());
    };
    let provided = headers.get(SECRET_HEADER).map(|v| v.as_bytes());
    if provided.is_some_and(|provided| secrets_match(expected.as_bytes(), provided)) {
        Ok(())
    } else {
        warn!("rejected request with missing or wrong shared secret");
        Err(RelayError::Unauthorized)
    }
}

/// Constant-time comparison: both sides are MACed under the expected secret
/// and the tags are checked with `verify_slice`.
fn secrets_match(expected: &[u8], provided: &[u8]) -> bool {
    let tag = |value: &[u8]| {
        HmacSha256::new_from_slice(expected).map(|mut mac| {
            mac.update(value);
            mac
        })
    };
    match (tag(provided), tag(expected)) {
        (Ok(provided), Ok(expected)) => {
            expected.verify_slice(&provided.finalize().into_bytes()).is_ok()
        }
        _ => false,
    }
}
