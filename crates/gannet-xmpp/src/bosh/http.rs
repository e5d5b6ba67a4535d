//! HTTP embedding of the BOSH bridge.
//!
//! One POST endpoint (`/http-bind`) carrying `<body/>` documents, plus the
//! Prometheus metrics endpoint on the same listener. TLS termination is
//! left to the HTTP deployment in front of this router.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use tracing::debug;

use crate::bosh::{BoshError, BoshManager, BoshReply};
use crate::metrics;
use crate::ns;
use crate::runtime::ServerRuntimeContext;
use crate::xml::{parse_document, Element};

/// Shared state for the BOSH HTTP handlers.
#[derive(Clone)]
pub struct BoshHttpState {
    /// Server runtime.
    pub ctx: Arc<ServerRuntimeContext>,
    /// The BOSH session registry.
    pub manager: Arc<BoshManager>,
}

/// Build the router serving `/http-bind` and `/metrics`.
pub fn bosh_router(state: BoshHttpState) -> Router {
    Router::new()
        .route("/http-bind", post(handle_bosh))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

async fn handle_bosh(State(state): State<BoshHttpState>, body: Bytes) -> impl IntoResponse {
    let parsed = match parse_document(&body).await {
        Ok(parsed) => parsed,
        Err(err) => {
            debug!(error = %err, "Unparseable BOSH request body");
            return xml_response(StatusCode::BAD_REQUEST, terminate_body("bad-request"));
        }
    };

    match state.manager.handle_request(&state.ctx, parsed).await {
        Ok(BoshReply::Now(response)) => xml_response(StatusCode::OK, response),
        Ok(BoshReply::Suspended(rx)) => match rx.await {
            Ok(response) => xml_response(StatusCode::OK, response),
            // The session went away while this request was suspended.
            Err(_) => xml_response(StatusCode::OK, terminate_body("item-not-found")),
        },
        Err(BoshError::BadRequest) => {
            xml_response(StatusCode::BAD_REQUEST, terminate_body("bad-request"))
        }
        Err(BoshError::ItemNotFound) => {
            xml_response(StatusCode::NOT_FOUND, terminate_body("item-not-found"))
        }
        Err(BoshError::Internal(reason)) => {
            debug!(reason = %reason, "Internal BOSH failure");
            xml_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                terminate_body("internal-server-error"),
            )
        }
    }
}

async fn handle_metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}

fn terminate_body(condition: &str) -> String {
    Element::builder("body", ns::HTTPBIND)
        .attr("type", "terminate")
        .attr("condition", condition)
        .build()
        .to_xml()
}

fn xml_response(status: StatusCode, body: String) -> (StatusCode, [(header::HeaderName, &'static str); 1], String) {
    (status, [(header::CONTENT_TYPE, "text/xml; charset=utf-8")], body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminate_body_shape() {
        let body = terminate_body("item-not-found");
        assert!(body.contains("type='terminate'"));
        assert!(body.contains("condition='item-not-found'"));
    }
}
