use std::future::Future;
use std::sync::Arc;

use axum::Router;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use snapwall_common::{ErrorResponse, FeedItem, ImageRecord, UploadResponse};
use tokio::net::TcpListener;
use tower_http::services::{ServeDir, ServeFile};

use crate::state::AppState;
use crate::store::StorageError;
use crate::upload::{Upload, UploadError};

pub fn router(state: Arc<AppState>) -> Router {
    let static_dir = &state.config.static_dir;
    Router::new()
        .route_service("/", ServeFile::new(static_dir.join("index.html")))
        .route_service("/gallery", ServeFile::new(static_dir.join("gallery.html")))
        .nest_service("/static", ServeDir::new(static_dir))
        .nest_service("/uploads", ServeDir::new(&state.config.upload_dir))
        .route("/api/images", get(images_handler))
        .route(
            "/upload",
            post(upload_handler).layer(DefaultBodyLimit::max(state.config.max_content_length)),
        )
        .with_state(state)
}

pub async fn run_http_server<F>(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

impl IntoResponse for StorageError {
    fn into_response(self) -> Response {
        tracing::error!("storage error: {}", self);
        let body = Json(ErrorResponse {
            error: "Storage unavailable".to_string(),
        });
        (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
    }
}

async fn images_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<FeedItem>>, StorageError> {
    let records = state.store.load().await?;
    let now = snapwall_common::local_now();
    let lifetime = state.store.lifetime();

    let feed = records
        .into_iter()
        .map(|record| FeedItem::at(record, lifetime, now))
        .collect();
    Ok(Json(feed))
}

async fn upload_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, UploadError> {
    let request_id = uuid::Uuid::new_v4();

    let mut file = None;
    let mut comment = None;
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("file") => {
                // a part without a filename is a plain form value, not a file
                let Some(original) = field.file_name().map(str::to_owned) else {
                    continue;
                };
                file = Some((original, field.bytes().await?));
            }
            Some("comment") => comment = Some(field.text().await?),
            _ => {}
        }
    }

    let now = snapwall_common::local_now();
    let upload = Upload::validate(file, comment, &state.config, now)?;
    let filename = upload.stored_name;

    state.payloads.write(&filename, &upload.data).await?;

    let record = ImageRecord::new(filename.clone(), upload.comment, now);
    let evicted = match state.store.append(record).await {
        Ok(evicted) => evicted,
        Err(e) => {
            state.payloads.purge(&filename, "orphaned").await;
            return Err(e.into());
        }
    };
    // payloads that fail to delete here are left to the sweep's orphan scan
    for old in &evicted {
        state.payloads.purge(&old.filename, "evicted").await;
    }

    tracing::info!(
        "stored upload {} ({} bytes), request_id: {}",
        filename,
        upload.data.len(),
        request_id
    );

    Ok(Json(UploadResponse {
        success: true,
        filename,
    }))
}
