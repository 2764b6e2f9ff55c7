pub mod admin;
pub mod serve;

use axum::{http::StatusCode, response::IntoResponse, Router};
use serde_json::json;
use tokio::signal;

use crate::errors::AppError;

// Make our own error that wraps `AppError`.
#[derive(Debug)]
pub struct HttpError(AppError);

// Tell axum how to convert `AppError` into a response.
impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            AppError::Validation(_) | AppError::BadRequest(_) | AppError::Base64(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InProgress => StatusCode::CONFLICT,
            AppError::Store(_)
            | AppError::Face(_)
            | AppError::Rebuild(_)
            | AppError::IO(_)
            | AppError::Other(_) => {
                log::error!("{self:?}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (
            status,
            axum::Json(json!({"success": false, "error": self.0.to_string()})),
        )
            .into_response()
    }
}

// This enables using `?` on anything convertible into `AppError`.
impl<E> From<E> for HttpError
where
    E: Into<AppError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

fn with_tracing(router: Router) -> Router {
    router.layer(
        tower_http::trace::TraceLayer::new_for_http()
            .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
            .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO)),
    )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                log::error!("failed to install signal handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::warn!("shutting down");
}

/// Run `router` on `listen` until Ctrl-C or SIGTERM.
pub fn run(router: Router, listen: &str) -> anyhow::Result<()> {
    let router = with_tracing(router);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async {
            let listener = tokio::net::TcpListener::bind(listen).await?;
            log::info!("listening on {listen}");
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await?;
            Ok::<(), anyhow::Error>(())
        })
}
