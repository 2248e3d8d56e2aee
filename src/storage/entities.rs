use sqlx::FromRow;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::feed::DATE_FORMAT;

#[derive(FromRow, Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub notification_id: i64,
    pub severity: i64,
    pub date_added: String,
    pub title: String,
    pub description: String,
    pub url: String,
    pub is_read: bool,
    pub is_remove: bool,
}

impl Notification {
    pub fn date_added(&self) -> Option<OffsetDateTime> {
        PrimitiveDateTime::parse(&self.date_added, DATE_FORMAT)
            .ok()
            .map(PrimitiveDateTime::assume_utc)
    }
}

#[derive(FromRow, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeverityCount {
    pub severity: i64,
    pub count: i64,
}

#[cfg(test)]
#[derive(FromRow, Debug, Clone, PartialEq, Eq)]
pub struct LayoutLink {
    pub layout_link_id: i64,
    pub store_id: i64,
    pub theme_id: i64,
    pub layout_update_id: i64,
    pub is_temporary: bool,
}
