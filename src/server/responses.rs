use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, Clone, Copy)]
pub struct NotificationNotFound {
    pub id: i64,
}

impl IntoResponse for NotificationNotFound {
    fn into_response(self) -> Response {
        let id = self.id;

        IntoResponse::into_response((
            StatusCode::NOT_FOUND,
            format!("Notification #{id} does not exist or was removed"),
        ))
    }
}
