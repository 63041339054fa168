use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::scheduler::RetryPolicy;

const DEFAULT_BACKOFF: &str = "60,120,300,600,1200";

#[derive(Parser, Debug, Clone)]
#[command(name = "notifyd")]
#[command(about = "Multi-channel notification dispatcher - routes, retries and audits deliveries")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the dispatch service (schedulers, consumer and dashboard)
    Run {
        #[command(flatten)]
        config: Config,
    },
    /// Submit a notification
    Send {
        #[command(flatten)]
        config: Config,

        /// Target user identifier
        #[arg(short, long)]
        user: String,

        /// Channel: email, sms, push, in-app or webhook
        #[arg(short, long)]
        channel: String,

        /// Channel-specific payload as a JSON object
        /// Example: --payload '{"to":"a@b.com","subject":"Hi","body":"Hello"}'
        #[arg(short, long, default_value = "{}")]
        payload: String,

        /// Template to render instead of the payload body field
        #[arg(short, long)]
        template_id: Option<i64>,

        /// Scheduled dispatch time (RFC 3339); omit to dispatch immediately
        #[arg(long, value_name = "TIMESTAMP")]
        at: Option<String>,
    },
    /// Cancel a notification that has not reached a terminal state
    Cancel {
        #[command(flatten)]
        config: Config,

        /// Notification id
        id: String,
    },
    /// Print the delivery audit trail for a notification
    Logs {
        #[command(flatten)]
        config: Config,

        /// Notification id
        id: String,
    },
    /// Register a webhook endpoint for a user
    AddEndpoint {
        #[command(flatten)]
        config: Config,

        /// User the endpoint belongs to
        #[arg(short, long)]
        user: String,

        /// Target URL for signed POSTs
        #[arg(long)]
        url: String,

        /// Shared secret used to sign payloads
        #[arg(long)]
        secret: String,
    },
    /// Store a message template
    AddTemplate {
        #[command(flatten)]
        config: Config,

        /// Template name
        #[arg(short, long)]
        name: String,

        /// Channel the template is written for
        #[arg(short, long)]
        channel: String,

        /// Optional subject line (email)
        #[arg(long)]
        subject: Option<String>,

        /// Template body with {{placeholder}} substitution
        #[arg(short, long)]
        body: String,
    },
}

#[derive(Parser, Debug, Clone)]
pub struct Config {
    /// Database file path
    #[arg(short, long, env = "NOTIFYD_DB", default_value = "notifyd.db")]
    pub db: PathBuf,

    /// Scheduled delivery trigger period in seconds
    #[arg(long, env = "NOTIFYD_DISPATCH_INTERVAL", default_value = "60")]
    pub dispatch_interval: u64,

    /// Retry scheduler period in seconds
    #[arg(long, env = "NOTIFYD_RETRY_INTERVAL", default_value = "120")]
    pub retry_interval: u64,

    /// Maximum delivery attempts before a notification is left FAILED
    #[arg(long, env = "NOTIFYD_MAX_ATTEMPTS", default_value = "5")]
    pub max_attempts: u32,

    /// Backoff table: comma-separated waits indexed by retry count
    /// Formats: "60,120,300" (seconds), "1m,2m,5m", "90s,5m"
    #[arg(long, env = "NOTIFYD_BACKOFF", value_name = "TABLE")]
    pub backoff: Option<String>,

    /// Maximum notifications examined per scheduler pass
    #[arg(long, env = "NOTIFYD_BATCH_LIMIT", default_value = "100")]
    pub batch_limit: u32,

    /// Email address to send from (must be a verified domain in Resend)
    /// Example: --email-from "Notifyd <notifications@yourdomain.com>"
    #[arg(long, env = "NOTIFYD_EMAIL_FROM")]
    pub email_from: Option<String>,

    /// Twilio number to send SMS from
    #[arg(long, env = "TWILIO_FROM_NUMBER")]
    pub sms_from: Option<String>,

    /// Dashboard port
    #[arg(long, env = "NOTIFYD_PORT", default_value = "3000")]
    pub port: u16,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Config {
    /// Validate the configuration and return errors if invalid
    pub fn validate(&self) -> Result<()> {
        validate_interval("dispatch-interval", self.dispatch_interval)?;
        validate_interval("retry-interval", self.retry_interval)?;

        if self.max_attempts == 0 {
            bail!("Invalid --max-attempts: must be at least 1");
        }

        if self.batch_limit == 0 {
            bail!("Invalid --batch-limit: must be at least 1");
        }

        if let Some(ref expr) = self.backoff {
            if parse_backoff_expr(expr).is_none() {
                bail!(
                    "Invalid backoff table '{}'.\n\
                     Expected comma-separated waits, e.g. \"60,120,300\" or \"1m,2m,5m\".",
                    expr
                );
            }
        }

        // Validate from address (can be "Name <email>" or just "email")
        if let Some(ref from) = self.email_from {
            let email_part = extract_email_from_address(from);
            if !is_valid_email(&email_part) {
                bail!(
                    "Invalid email address in --email-from: '{}'\n\
                     Expected format: \"Name <email@domain.com>\" or \"email@domain.com\"",
                    from
                );
            }
        }

        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let table = self
            .backoff
            .as_deref()
            .and_then(parse_backoff_expr)
            .unwrap_or_else(|| parse_backoff_expr(DEFAULT_BACKOFF).expect("default table parses"));
        RetryPolicy::new(table, self.max_attempts)
    }
}

/// Parse a backoff table expression into per-retry waits in seconds.
/// Each entry is a bare number of seconds or a number with an "s" or "m"
/// suffix. Entries must be positive.
fn parse_backoff_expr(expr: &str) -> Option<Vec<u64>> {
    let expr = expr.trim();
    if expr.is_empty() {
        return None;
    }

    let mut table = Vec::new();
    for entry in expr.split(',') {
        let entry = entry.trim();

        let (number, multiplier) = if let Some(stripped) = entry.strip_suffix('m') {
            (stripped, 60)
        } else if let Some(stripped) = entry.strip_suffix('s') {
            (stripped, 1)
        } else {
            (entry, 1)
        };

        let value: u64 = number.trim().parse().ok()?;
        if value == 0 {
            return None;
        }
        table.push(value * multiplier);
    }

    Some(table)
}

/// Simple email validation (not RFC 5322 compliant but good enough)
fn is_valid_email(email: &str) -> bool {
    let email = email.trim();
    if email.is_empty() {
        return false;
    }

    // Must contain exactly one @
    let parts: Vec<&str> = email.split('@').collect();
    if parts.len() != 2 {
        return false;
    }

    let local = parts[0];
    let domain = parts[1];

    if local.is_empty() {
        return false;
    }

    // Domain must contain at least one dot and not be empty
    if domain.is_empty() || !domain.contains('.') {
        return false;
    }

    true
}

/// Extract email from "Name <email>" format, or return as-is if just email
fn extract_email_from_address(address: &str) -> String {
    let address = address.trim();
    if let Some(start) = address.find('<') {
        if let Some(end) = address.find('>') {
            return address[start + 1..end].trim().to_string();
        }
    }
    address.to_string()
}

fn validate_interval(name: &str, interval: u64) -> Result<()> {
    if interval < 5 {
        bail!(
            "Invalid --{}: {} seconds is too short. Minimum is 5 seconds.",
            name,
            interval
        );
    }
    Ok(())
}
