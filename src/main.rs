use chrono::{FixedOffset, Utc};
use std::fs::OpenOptions;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::{format::Writer, time::FormatTime};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use palgate_relay::config::AppConfig;
use palgate_relay::models::log::escape_html;
use palgate_relay::poller::{self, FeedTarget, PollCycle};
use palgate_relay::services::auth::{AuthTokenProvider, CommandTokenGenerator};
use palgate_relay::services::fetcher::Fetcher;
use palgate_relay::services::notifier::{Notifier, TelegramNotifier};
use palgate_relay::services::retry::RetryPolicy;

/// Log timestamps in the configured fixed offset instead of the host zone.
#[derive(Clone)]
struct OffsetTime(FixedOffset);

impl FormatTime for OffsetTime {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(
            w,
            "{}",
            Utc::now()
                .with_timezone(&self.0)
                .format("%Y-%m-%d %H:%M:%S%.3f%:z")
        )
    }
}

/// Resolves when `signal` fires. A handler that could not be registered, or
/// whose stream closed, never resolves.
#[cfg(unix)]
async fn wait_for_signal(signal: Option<tokio::signal::unix::Signal>) {
    let Some(mut signal) = signal else {
        return std::future::pending().await;
    };
    if signal.recv().await.is_none() {
        warn!("Signal stream closed unexpectedly");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let sigterm = signal(SignalKind::terminate())
        .map_err(|e| warn!("Failed to register SIGTERM handler: {}", e))
        .ok();
    wait_for_signal(sigterm).await;
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}

async fn interrupt_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn setup_shutdown_signal() {
    tokio::select! {
        () = interrupt_signal() => {
            info!("Received Ctrl+C, finishing current cycle");
        }
        () = terminate_signal() => {
            info!("Received SIGTERM, finishing current cycle");
        }
    }
}

fn build_subscriber(
    config: &AppConfig,
) -> anyhow::Result<impl tracing::Subscriber + Send + Sync + 'static> {
    let filter = EnvFilter::try_new(format!(
        "{level},hyper=info,reqwest=info",
        level = config.log.level
    ))
    .unwrap_or_else(|_| EnvFilter::new(&config.log.level));
    let timer = OffsetTime(config.tz_offset());
    let json = config.log.format == "json";

    let file_layer = match &config.log.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| anyhow::anyhow!("Cannot open log file {path}: {e}"))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_timer(timer.clone())
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    let json_layer = json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_timer(timer.clone())
            .with_target(false)
            .with_current_span(true)
            .with_span_list(true)
    });
    let pretty_layer = (!json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_timer(timer.clone())
            .with_target(true)
    });

    Ok(tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(pretty_layer)
        .with(file_layer))
}

fn setup_logging(config: &AppConfig) -> anyhow::Result<()> {
    build_subscriber(config)?.init();
    Ok(())
}

fn initialize_poller(config: &AppConfig) -> anyhow::Result<(PollCycle, Arc<dyn Notifier>)> {
    let generator = CommandTokenGenerator::new(&config.auth.token_command, config.token_timeout())
        .map_err(|e| {
            error!("Failed to initialize token generator: {e}");
            anyhow::anyhow!("Token generator initialization failed: {e}")
        })?;
    let tokens = AuthTokenProvider::new(
        Arc::new(generator),
        config.session_secret()?,
        config.device.user_id,
        config.device.token_kind,
    );

    let fetcher = Fetcher::new(config.http_timeout(), config.retry_policy())?;

    let chat: Arc<dyn Notifier> = Arc::new(TelegramNotifier::new(
        &config.telegram.api_base_url,
        &config.telegram.api_token,
        config.telegram.chat_id,
        RetryPolicy::default(),
    )?);
    let admin: Arc<dyn Notifier> = Arc::new(TelegramNotifier::new(
        &config.telegram.api_base_url,
        &config.telegram.api_token,
        config.telegram.log_chat_id,
        RetryPolicy::default(),
    )?);

    let target = FeedTarget::new(
        &config.device.id,
        &config.device.url_template,
        &config.device.user_agent,
    );

    Ok((
        PollCycle::new(target, tokens, fetcher, chat, admin.clone()),
        admin,
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::new().map_err(|e| {
        anyhow::anyhow!(
            "Failed to load configuration: {e}. Please check your environment variables and configuration."
        )
    })?;

    setup_logging(&config)?;

    info!("Starting palgate-relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        device_id = %config.device.id,
        interval_secs = config.poll.interval_secs,
        tries = config.http.tries,
        "Config loaded"
    );

    let (cycle, admin) = initialize_poller(&config)?;

    let status = format!(
        "palgate-relay v{} started for device {}",
        env!("CARGO_PKG_VERSION"),
        escape_html(&config.device.id)
    );
    if let Err(e) = admin.send(&status).await {
        warn!(error = %e, "Failed to send startup status");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        setup_shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    poller::run(cycle, config.poll_interval(), shutdown_rx).await;

    info!("Shutdown complete");
    Ok(())
}
