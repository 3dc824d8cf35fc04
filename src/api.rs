//! Small HTTP boundary unrelated to the conversational core: maps a
//! diagnosis string to a treatment-protocol name from a static table.

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Known diagnosis to protocol mapping, matched case-insensitively.
const PROTOCOLS: [(&str, &str); 2] = [
    ("диабет 2 типа", "standard protocol"),
    ("диабет 1 типа", "insulin protocol"),
];

pub fn find_protocol_by_diagnosis(diagnosis: &str) -> Option<&'static str> {
    let needle = diagnosis.trim().to_lowercase();
    PROTOCOLS
        .iter()
        .find(|(name, _)| *name == needle)
        .map(|(_, protocol)| *protocol)
}

#[derive(Debug, Deserialize)]
pub struct DiagnoseRequest {
    pub diagnosis: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct DiagnoseResponse {
    pub protocol: String,
}

pub async fn diagnose(
    Json(request): Json<DiagnoseRequest>,
) -> Result<Json<DiagnoseResponse>, StatusCode> {
    match find_protocol_by_diagnosis(&request.diagnosis) {
        Some(protocol) => Ok(Json(DiagnoseResponse {
            protocol: protocol.to_string(),
        })),
        None => Err(StatusCode::NOT_FOUND),
    }
}

pub fn router() -> Router {
    Router::new().route("/v1/ai/diagnose", post(diagnose))
}

/// Serve the diagnose endpoint; runs until the process exits.
pub async fn serve(addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind diagnose endpoint on {addr}"))?;
    info!(addr = %addr, "Diagnose endpoint listening");

    axum::serve(listener, router())
        .await
        .context("Diagnose endpoint server failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_lookup() {
        assert_eq!(
            find_protocol_by_diagnosis("диабет 2 типа"),
            Some("standard protocol")
        );
        assert_eq!(
            find_protocol_by_diagnosis("  Диабет 1 типа "),
            Some("insulin protocol")
        );
        assert_eq!(find_protocol_by_diagnosis("грипп"), None);
    }

    #[tokio::test]
    async fn test_diagnose_handler() {
        let response = diagnose(Json(DiagnoseRequest {
            diagnosis: "диабет 1 типа".to_string(),
        }))
        .await
        .unwrap();
        assert_eq!(response.0.protocol, "insulin protocol");

        let missing = diagnose(Json(DiagnoseRequest {
            diagnosis: "неизвестно".to_string(),
        }))
        .await;
        assert!(matches!(missing, Err(StatusCode::NOT_FOUND)));
    }
}
