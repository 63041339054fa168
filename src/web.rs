use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::Html,
    routing::get,
    Router,
};
use tracing::info;
use uuid::Uuid;

use crate::models::{DeliveryLog, Notification, NotificationStatus};
use crate::store::Store;

/// Application state shared between handlers
pub struct AppState {
    pub store: Store,
}

/// Create the Axum router with all routes
pub fn create_router(store: Store) -> Router {
    let state = Arc::new(AppState { store });

    Router::new()
        .route("/", get(dashboard))
        .route("/notifications/{id}", get(notification_detail))
        .with_state(state)
}

/// Start the web server on the given port
pub async fn start_server(router: Router, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        port = port,
        addr = %addr,
        "Dashboard started"
    );

    axum::serve(listener, router).await?;
    Ok(())
}

/// Dashboard page: recent notifications with their dispatch state
async fn dashboard(State(state): State<Arc<AppState>>) -> Html<String> {
    let notifications = state.store.recent_notifications(100).await.unwrap_or_default();
    Html(render_dashboard(&notifications))
}

/// Notification detail page with its delivery audit trail
async fn notification_detail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Html<String> {
    let Ok(id) = Uuid::parse_str(&id) else {
        return Html(render_error("Invalid notification id"));
    };

    match state.store.find_notification(id).await {
        Ok(Some(notification)) => {
            let logs = state.store.delivery_logs(id).await.unwrap_or_default();
            Html(render_detail(&notification, &logs))
        }
        Ok(None) => Html(render_error("Notification not found")),
        Err(e) => Html(render_error(&format!("Error: {}", e))),
    }
}

const PAGE_STYLE: &str = r#"
        body { padding: 2rem 0; }
        nav { margin-bottom: 2rem; }
        nav a { margin-right: 1rem; }
        table { width: 100%; }
        .count { color: #606c76; font-weight: normal; }
        .status { display: inline-block; padding: 0.2rem 0.5rem; border-radius: 3px; font-size: 0.9rem; }
        .status-sent { background: #d4edda; color: #155724; }
        .status-failed { background: #f8d7da; color: #721c24; }
        .status-pending { background: #cce5ff; color: #004085; }
        .status-other { background: #fff3cd; color: #856404; }
        .detail-grid { display: grid; grid-template-columns: auto 1fr; gap: 0.5rem 2rem; }
        .detail-grid dt { font-weight: bold; }
        pre { white-space: pre-wrap; word-break: break-all; }
"#;

fn status_badge(status: NotificationStatus) -> String {
    let class = match status {
        NotificationStatus::Sent => "status status-sent",
        NotificationStatus::Failed | NotificationStatus::Cancelled => "status status-failed",
        NotificationStatus::Pending => "status status-pending",
        _ => "status status-other",
    };
    format!(r#"<span class="{}">{}</span>"#, class, status)
}

/// Render the dashboard HTML
fn render_dashboard(notifications: &[Notification]) -> String {
    let mut rows = String::new();
    for n in notifications {
        rows.push_str(&format!(
            r#"<tr>
                <td><a href="/notifications/{}">{}</a></td>
                <td>{}</td>
                <td>{}</td>
                <td>{}</td>
                <td>{}</td>
                <td>{}</td>
                <td>{}</td>
            </tr>"#,
            n.id,
            short_id(n.id),
            html_escape(&n.user_id),
            n.channel,
            status_badge(n.status),
            n.retries,
            n.sent_at
                .map(|t| format_timestamp(&t.to_rfc3339()))
                .unwrap_or_else(|| "-".to_string()),
            format_timestamp(&n.updated_at.to_rfc3339()),
        ));
    }

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Notifyd Dashboard</title>
    <link rel="stylesheet" href="https://cdnjs.cloudflare.com/ajax/libs/milligram/1.4.1/milligram.min.css">
    <style>{}</style>
</head>
<body>
    <main class="container">
        <h1>Notifyd Dashboard</h1>
        <nav>
            <a href="/" class="button button-outline">Notifications</a>
        </nav>

        <h2>Recent Notifications <span class="count">({} shown)</span></h2>
        <table>
            <thead>
                <tr>
                    <th>ID</th>
                    <th>User</th>
                    <th>Channel</th>
                    <th>Status</th>
                    <th>Retries</th>
                    <th>Sent At</th>
                    <th>Updated</th>
                </tr>
            </thead>
            <tbody>
                {}
            </tbody>
        </table>
    </main>
</body>
</html>"#,
        PAGE_STYLE,
        notifications.len(),
        rows
    )
}

/// Render the notification detail HTML with its delivery log
fn render_detail(notification: &Notification, logs: &[DeliveryLog]) -> String {
    let mut log_rows = String::new();
    for log in logs {
        log_rows.push_str(&format!(
            r#"<tr>
                <td>{}</td>
                <td>{}</td>
                <td>{}</td>
                <td><pre>{}</pre></td>
            </tr>"#,
            log.attempt,
            log.status_code,
            format_timestamp(&log.created_at.to_rfc3339()),
            html_escape(&log.response_payload),
        ));
    }
    if logs.is_empty() {
        log_rows.push_str(r#"<tr><td colspan="4">No delivery attempts recorded</td></tr>"#);
    }

    let payload = serde_json::to_string_pretty(&notification.payload).unwrap_or_default();

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Notification {} - Notifyd</title>
    <link rel="stylesheet" href="https://cdnjs.cloudflare.com/ajax/libs/milligram/1.4.1/milligram.min.css">
    <style>{}</style>
</head>
<body>
    <main class="container">
        <h1>Notifyd Dashboard</h1>
        <nav>
            <a href="/" class="button button-clear">Notifications</a>
        </nav>

        <h2>Notification {}</h2>

        <dl class="detail-grid">
            <dt>User</dt>
            <dd>{}</dd>

            <dt>Channel</dt>
            <dd>{}</dd>

            <dt>Status</dt>
            <dd>{}</dd>

            <dt>Retries</dt>
            <dd>{}</dd>

            <dt>Scheduled At</dt>
            <dd>{}</dd>

            <dt>Sent At</dt>
            <dd>{}</dd>

            <dt>Created</dt>
            <dd>{}</dd>

            <dt>Updated</dt>
            <dd>{}</dd>
        </dl>

        <h3>Payload</h3>
        <pre>{}</pre>

        <h3>Delivery Log <span class="count">({} attempts)</span></h3>
        <table>
            <thead>
                <tr>
                    <th>Attempt</th>
                    <th>Code</th>
                    <th>Timestamp</th>
                    <th>Response</th>
                </tr>
            </thead>
            <tbody>
                {}
            </tbody>
        </table>

        <p><a href="/">&larr; Back to Notifications</a></p>
    </main>
</body>
</html>"#,
        short_id(notification.id),
        PAGE_STYLE,
        notification.id,
        html_escape(&notification.user_id),
        notification.channel,
        status_badge(notification.status),
        notification.retries,
        notification
            .scheduled_at
            .map(|t| format_timestamp(&t.to_rfc3339()))
            .unwrap_or_else(|| "-".to_string()),
        notification
            .sent_at
            .map(|t| format_timestamp(&t.to_rfc3339()))
            .unwrap_or_else(|| "-".to_string()),
        format_timestamp(&notification.created_at.to_rfc3339()),
        format_timestamp(&notification.updated_at.to_rfc3339()),
        html_escape(&payload),
        logs.len(),
        log_rows
    )
}

/// Render an error page
fn render_error(message: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Error - Notifyd</title>
    <link rel="stylesheet" href="https://cdnjs.cloudflare.com/ajax/libs/milligram/1.4.1/milligram.min.css">
    <style>
        body {{ padding: 2rem 0; }}
        .error {{ color: #dc3545; }}
    </style>
</head>
<body>
    <main class="container">
        <h1>Notifyd Dashboard</h1>
        <p class="error">{}</p>
        <p><a href="/">&larr; Back to Dashboard</a></p>
    </main>
</body>
</html>"#,
        html_escape(message)
    )
}

fn short_id(id: Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

/// Simple HTML escaping
fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}

/// Format timestamp for display (truncate to readable format)
fn format_timestamp(ts: &str) -> String {
    // RFC3339 format: 2024-01-15T10:30:00+00:00
    // We want: 2024-01-15 10:30:00
    ts.replace('T', " ").chars().take(19).collect()
}
