mod bus;
mod config;
mod consumer;
mod dispatcher;
mod models;
mod scheduler;
mod store;
mod template;
mod web;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{Cli, Command, Config};
use crate::dispatcher::{
    DispatchRouter, EmailDispatcher, InAppDispatcher, PushDispatcher, SmsDispatcher,
    TwilioCredentials, WebhookDispatcher,
};
use crate::models::{ChannelType, Notification, NotificationStatus};
use crate::scheduler::{run_dispatch_trigger, run_retry_scheduler};
use crate::store::Store;

const DEFAULT_EMAIL_FROM: &str = "Notifyd <onboarding@resend.dev>";

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (useful for local development)
    dotenvy::dotenv().ok();

    let cli = Cli::parse_args();

    match cli.command {
        Command::Run { config } => {
            init_logging(config.verbose);
            config.validate()?;
            run_service(config).await
        }
        Command::Send {
            config,
            user,
            channel,
            payload,
            template_id,
            at,
        } => {
            init_logging(config.verbose);
            run_send(&config, user, &channel, &payload, template_id, at.as_deref()).await
        }
        Command::Cancel { config, id } => {
            init_logging(config.verbose);
            run_cancel(&config, &id).await
        }
        Command::Logs { config, id } => {
            init_logging(config.verbose);
            run_logs(&config, &id).await
        }
        Command::AddEndpoint {
            config,
            user,
            url,
            secret,
        } => {
            init_logging(config.verbose);
            run_add_endpoint(&config, &user, &url, &secret).await
        }
        Command::AddTemplate {
            config,
            name,
            channel,
            subject,
            body,
        } => {
            init_logging(config.verbose);
            run_add_template(&config, &name, &channel, subject.as_deref(), &body).await
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn log_config(config: &Config) {
    info!(
        db = %config.db.display(),
        dispatch_interval_secs = config.dispatch_interval,
        retry_interval_secs = config.retry_interval,
        max_attempts = config.max_attempts,
        batch_limit = config.batch_limit,
        port = config.port,
        "Configuration loaded"
    );
}

/// Build the lookup table of channel dispatchers. Provider credentials come
/// from the environment; a dispatcher whose provider is unconfigured still
/// registers, and reports the missing credentials per delivery attempt.
fn build_router(store: &Store, config: &Config) -> DispatchRouter {
    let mut router = DispatchRouter::new();

    let resend_api_key = std::env::var("RESEND_API_KEY").ok();
    if resend_api_key.is_none() {
        warn!("RESEND_API_KEY not set, email deliveries will fail");
    }
    let email_from = config
        .email_from
        .clone()
        .unwrap_or_else(|| DEFAULT_EMAIL_FROM.to_string());
    router.register(Box::new(EmailDispatcher::new(
        store.clone(),
        resend_api_key,
        email_from,
    )));

    let twilio = match (
        std::env::var("TWILIO_ACCOUNT_SID").ok(),
        std::env::var("TWILIO_AUTH_TOKEN").ok(),
        config.sms_from.clone(),
    ) {
        (Some(account_sid), Some(auth_token), Some(from_number)) => Some(TwilioCredentials {
            account_sid,
            auth_token,
            from_number,
        }),
        _ => {
            warn!("Twilio credentials not fully set, SMS deliveries will fail");
            None
        }
    };
    router.register(Box::new(SmsDispatcher::new(store.clone(), twilio)));

    router.register(Box::new(PushDispatcher::new(store.clone())));
    router.register(Box::new(InAppDispatcher::new(store.clone())));
    router.register(Box::new(WebhookDispatcher::new(store.clone())));

    router
}

async fn run_service(config: Config) -> Result<()> {
    log_config(&config);

    let store = Store::open(&config.db)?;
    let router = Arc::new(build_router(&store, &config));
    let (publisher, rx) = bus::channel();

    let token = CancellationToken::new();

    let trigger_handle = tokio::spawn(run_dispatch_trigger(
        store.clone(),
        publisher.clone(),
        Duration::from_secs(config.dispatch_interval),
        config.batch_limit,
        token.clone(),
    ));

    let retry_handle = tokio::spawn(run_retry_scheduler(
        store.clone(),
        publisher.clone(),
        config.retry_policy(),
        Duration::from_secs(config.retry_interval),
        config.batch_limit,
        token.clone(),
    ));

    let consumer_handle = tokio::spawn(consumer::run_consumer(rx, router, token.clone()));

    let web_router = web::create_router(store.clone());
    let port = config.port;
    let web_handle = tokio::spawn(async move {
        if let Err(e) = web::start_server(web_router, port).await {
            error!(error = %e, "Dashboard server failed");
        }
    });

    info!("Notifyd running, press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutdown signal received, stopping tasks");
    token.cancel();
    drop(publisher); // close the bus so the consumer drains and exits

    let _ = trigger_handle.await;
    let _ = retry_handle.await;
    let _ = consumer_handle.await;
    web_handle.abort();

    info!("Shutdown complete");
    Ok(())
}

fn parse_channel(s: &str) -> Result<ChannelType> {
    ChannelType::parse(s).with_context(|| {
        format!(
            "Unknown channel '{}'. Expected one of: email, sms, push, in-app, webhook",
            s
        )
    })
}

async fn run_send(
    config: &Config,
    user: String,
    channel: &str,
    payload: &str,
    template_id: Option<i64>,
    at: Option<&str>,
) -> Result<()> {
    let channel = parse_channel(channel)?;

    let payload: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(payload).context("Invalid --payload: expected a JSON object")?;

    let scheduled_at = at
        .map(|s| {
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .with_context(|| format!("Invalid --at timestamp '{}': expected RFC 3339", s))
        })
        .transpose()?;

    let store = Store::open(&config.db)?;
    let notification = Notification::new(user, channel, template_id, payload, scheduled_at);
    store.insert_notification(&notification).await?;

    info!(
        notification_id = %notification.id,
        channel = %notification.channel,
        scheduled_at = ?notification.scheduled_at,
        "Notification queued"
    );
    println!("{}", notification.id);
    Ok(())
}

async fn run_cancel(config: &Config, id: &str) -> Result<()> {
    let id = Uuid::parse_str(id).context("Invalid notification id")?;
    let store = Store::open(&config.db)?;

    let Some(mut notification) = store.find_notification(id).await? else {
        bail!("Notification {} not found", id);
    };

    notification
        .transition(NotificationStatus::Cancelled, Utc::now())
        .with_context(|| format!("Cannot cancel notification in state {}", notification.status))?;
    store.update_notification(&mut notification).await?;

    info!(notification_id = %id, "Notification cancelled");
    println!("Cancelled {}", id);
    Ok(())
}

async fn run_logs(config: &Config, id: &str) -> Result<()> {
    let id = Uuid::parse_str(id).context("Invalid notification id")?;
    let store = Store::open(&config.db)?;

    let Some(notification) = store.find_notification(id).await? else {
        bail!("Notification {} not found", id);
    };

    println!(
        "{}  user={}  channel={}  status={}  retries={}",
        notification.id,
        notification.user_id,
        notification.channel,
        notification.status,
        notification.retries
    );

    let logs = store.delivery_logs(id).await?;
    if logs.is_empty() {
        println!("No delivery attempts recorded");
        return Ok(());
    }

    for log in logs {
        println!(
            "attempt {}  code {}  at {}  {}",
            log.attempt,
            log.status_code,
            log.created_at.to_rfc3339(),
            log.response_payload
        );
    }
    Ok(())
}

async fn run_add_endpoint(config: &Config, user: &str, url: &str, secret: &str) -> Result<()> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        bail!("Invalid --url '{}': must start with http:// or https://", url);
    }

    let store = Store::open(&config.db)?;
    let endpoint_id = store.insert_endpoint(user, url, secret).await?;

    info!(endpoint_id = endpoint_id, user_id = user, url = url, "Webhook endpoint registered");
    println!("Registered endpoint {} for {}", endpoint_id, user);
    Ok(())
}

async fn run_add_template(
    config: &Config,
    name: &str,
    channel: &str,
    subject: Option<&str>,
    body: &str,
) -> Result<()> {
    let channel = parse_channel(channel)?;

    let store = Store::open(&config.db)?;
    let template_id = store.insert_template(name, channel, subject, body).await?;

    info!(template_id = template_id, name = name, channel = %channel, "Template stored");
    println!("Stored template {}", template_id);
    Ok(())
}
