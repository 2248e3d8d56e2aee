use anyhow::{anyhow, Context as _};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Result};
use axum::Json;
use rss::{CategoryBuilder, ChannelBuilder, GuidBuilder, ItemBuilder};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc2822;
use time::OffsetDateTime;
use tracing::error;

use crate::feed::{format_date, Severity};
use crate::layout::{FragmentKey, LayoutUpdate};
use crate::server::convert_errors;
use crate::state::State as AppState;
use crate::storage::entities::Notification;
use crate::template::Page;

use super::responses::NotificationNotFound;

const MAX_NOTIFICATION_COUNT: usize = 100;

fn severity_label(severity: i64) -> String {
    Severity::from_level(severity)
        .map(|severity| severity.to_string())
        .unwrap_or_else(|| format!("level {severity}"))
}

pub async fn index(State(state): State<AppState>) -> Result<Html<String>> {
    #[derive(Serialize, Debug, Clone)]
    struct NotificationDescription {
        id: i64,
        severity: String,
        date_added: String,
        title: String,
        description: String,
        url: String,
        is_read: bool,
    }

    #[derive(Serialize, Debug, Clone)]
    struct UnreadCount {
        severity: String,
        count: i64,
    }

    #[derive(Serialize, Debug, Clone)]
    struct Context {
        feed_url: String,
        last_check: String,
        unread: Vec<UnreadCount>,
        notifications: Vec<NotificationDescription>,
    }

    convert_errors(async move {
        let last_check = match state.checker.last_check().await? {
            Some(timestamp) => OffsetDateTime::from_unix_timestamp(timestamp)
                .map(format_date)
                .with_context(|| anyhow!("the last check time {timestamp} is out of range"))?,

            None => "never".into(),
        };

        let mut tx = state.storage.begin().await?;
        let counts = tx.get_unread_severity_counts().await?;
        let notifications = tx.get_notifications(MAX_NOTIFICATION_COUNT).await?;
        tx.commit().await?;

        let ctx = Context {
            feed_url: state.checker.feed_url().into(),
            last_check,
            unread: counts
                .into_iter()
                .map(|count| UnreadCount {
                    severity: severity_label(count.severity),
                    count: count.count,
                })
                .collect(),
            notifications: notifications
                .into_iter()
                .map(|n| NotificationDescription {
                    id: n.notification_id,
                    severity: severity_label(n.severity),
                    date_added: n.date_added,
                    title: n.title,
                    description: n.description,
                    url: n.url,
                    is_read: n.is_read,
                })
                .collect(),
        };
        let html = state
            .template
            .render(Page::Inbox.name(), &ctx)
            .context("could not render the HTML template")?;

        Ok(Html(html))
    })
    .await
}

fn notification_item(notification: Notification) -> rss::Item {
    let pub_date = notification.date_added().and_then(|date_added| {
        date_added
            .format(&Rfc2822)
            .inspect_err(|e| error!("could not format the date ({date_added}): {e:#}"))
            .ok()
    });

    ItemBuilder::default()
        .title(Some(notification.title))
        .link(Some(notification.url).filter(|url| !url.is_empty()))
        .description(Some(notification.description))
        .category(
            CategoryBuilder::default()
                .name(severity_label(notification.severity))
                .build(),
        )
        .guid(Some(
            GuidBuilder::default()
                .value(format!("notifeed/{}", notification.notification_id))
                .permalink(false)
                .build(),
        ))
        .pub_date(pub_date)
        .build()
}

pub async fn notifications_feed(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let notifications = convert_errors(async {
        let mut tx = state.storage.begin().await?;
        let notifications = tx.get_notifications(MAX_NOTIFICATION_COUNT).await?;
        tx.commit().await?;

        Ok(notifications)
    })
    .await?;

    let now = OffsetDateTime::now_utc();
    let mut channel = ChannelBuilder::default();
    channel
        .title("Notifications")
        .link(state.checker.feed_url())
        .description("Admin notification inbox")
        .last_build_date(
            now.format(&Rfc2822)
                .inspect_err(|e| error!("could not format the last build date ({now}): {e:#}"))
                .ok(),
        )
        .generator(Some(format!("notifeed {}", env!("CARGO_PKG_VERSION"))));

    for notification in notifications {
        channel.item(notification_item(notification));
    }

    Ok((
        [(header::CONTENT_TYPE, "application/rss+xml")],
        channel.build().to_string(),
    ))
}

pub async fn mark_read(State(state): State<AppState>, Path(id): Path<i64>) -> Result<()> {
    let found = convert_errors(async {
        let mut tx = state.storage.begin().await?;
        let found = tx.mark_notification_read(id).await?;
        tx.commit().await?;

        Ok(found)
    })
    .await?;

    if !found {
        return Err(NotificationNotFound { id }.into());
    }

    Ok(())
}

pub async fn remove(State(state): State<AppState>, Path(id): Path<i64>) -> Result<()> {
    let found = convert_errors(async {
        let mut tx = state.storage.begin().await?;
        let found = tx.remove_notification(id).await?;
        tx.commit().await?;

        Ok(found)
    })
    .await?;

    if !found {
        return Err(NotificationNotFound { id }.into());
    }

    Ok(())
}

pub async fn check(State(state): State<AppState>) -> StatusCode {
    state.wake_up.notify_one();

    StatusCode::ACCEPTED
}

#[derive(Deserialize, Debug, Clone)]
pub struct LayoutQuery {
    theme: i64,

    #[serde(default)]
    store: i64,

    #[serde(default)]
    temporary: bool,
}

pub async fn get_layout(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    Query(query): Query<LayoutQuery>,
) -> Result<impl IntoResponse> {
    let key = FragmentKey {
        handle,
        theme_id: query.theme,
        store_id: query.store,
        include_temporary: query.temporary,
    };
    let xml = convert_errors(state.layout.cached_fragments(key)).await?;

    Ok(([(header::CONTENT_TYPE, "application/xml")], xml))
}

#[derive(Serialize, Debug, Clone, Copy)]
pub struct SavedLayoutUpdate {
    layout_update_id: i64,
}

pub async fn save_layout_update(
    State(state): State<AppState>,
    Json(update): Json<LayoutUpdate>,
) -> Result<Json<SavedLayoutUpdate>> {
    let layout_update_id = convert_errors(state.layout.save_layout_update(&update)).await?;

    Ok(Json(SavedLayoutUpdate { layout_update_id }))
}
