use std::collections::HashMap;

use axum::{
    extract::{DefaultBodyLimit, Multipart},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::errors::{AppError, AppResult};
use crate::state::{AppState, HttpSettings};

pub mod users;
pub mod videos;

/// Largest upload body accepted, sized for video files
const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

/// Largest body accepted by the JSON endpoints
const MAX_JSON_BYTES: usize = 16 * 1024;

/// Build the application router with all routes
pub fn routes(app_state: AppState) -> Router {
    let api = Router::new()
        .route("/healthcheck", get(healthcheck))
        .route(
            "/users/register",
            post(users::register).layer(DefaultBodyLimit::disable()),
        )
        .route("/users/login", post(users::login))
        .route("/users/logout", post(users::logout))
        .route("/users/refresh-token", post(users::refresh_token))
        .route("/users/change-password", post(users::change_password))
        .route("/users/current-user", get(users::current_user))
        .route("/videos", post(videos::publish).layer(DefaultBodyLimit::disable()))
        .route("/videos/:id", get(videos::get_video));

    Router::new()
        .nest("/api/v1", api)
        .layer(DefaultBodyLimit::max(MAX_JSON_BYTES))
        .layer(RequestBodyLimitLayer::new(MAX_UPLOAD_BYTES))
        .layer(cors_layer(&app_state.http))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

fn cors_layer(settings: &HttpSettings) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    match settings.cors_origin.as_deref().map(HeaderValue::from_str) {
        Some(Ok(origin)) => layer.allow_origin(origin),
        Some(Err(err)) => {
            warn!("Ignoring unparseable CORS_ORIGIN, allowing any origin: {}", err);
            layer.allow_origin(Any)
        }
        None => layer.allow_origin(Any),
    }
}

/// Bind the configured port and serve until the listener fails
pub async fn run_server(app_state: AppState) -> color_eyre::Result<()> {
    let port = app_state.http.port;
    let app = routes(app_state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}

/// Success envelope shared by every JSON endpoint
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    #[serde(skip)]
    status: StatusCode,
    success: bool,
    data: T,
    message: String,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::OK, data, message)
    }

    pub fn created(data: T, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::CREATED, data, message)
    }

    fn with_status(status: StatusCode, data: T, message: impl Into<String>) -> Self {
        Self {
            status,
            success: true,
            data,
            message: message.into(),
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
}

async fn healthcheck() -> ApiResponse<Health> {
    ApiResponse::ok(
        Health {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
        },
        "healthy",
    )
}

/// A multipart body split into text fields and file parts
#[derive(Debug, Default)]
pub(crate) struct MultipartForm {
    fields: HashMap<String, String>,
    files: HashMap<String, Vec<u8>>,
}

impl MultipartForm {
    pub(crate) async fn read(mut multipart: Multipart) -> AppResult<Self> {
        let mut form = Self::default();

        while let Some(field) = multipart.next_field().await.map_err(malformed)? {
            let Some(name) = field.name().map(str::to_owned) else {
                continue;
            };

            if field.file_name().is_some() {
                let bytes = field.bytes().await.map_err(malformed)?;
                form.files.insert(name, bytes.to_vec());
            } else {
                let text = field.text().await.map_err(malformed)?;
                form.fields.insert(name, text);
            }
        }

        Ok(form)
    }

    /// Text field value, empty when absent
    pub(crate) fn text(&self, name: &str) -> String {
        self.fields.get(name).cloned().unwrap_or_default()
    }

    pub(crate) fn take_file(&mut self, name: &str) -> Option<Vec<u8>> {
        self.files.remove(name)
    }
}

fn malformed(err: axum::extract::multipart::MultipartError) -> AppError {
    AppError::validation(format!("malformed multipart body: {err}"))
}
