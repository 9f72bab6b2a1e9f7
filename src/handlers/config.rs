use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

/// `GET /api/v1/config`, with the upstream API key masked.
pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config().redacted();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config
    })))
}

/// `PUT /api/v1/config`. Applies to relay sessions opened after the update;
/// sessions already running keep the settings they started with.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;
    info!("Runtime configuration updated");

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": current_config.redacted()
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::body::to_bytes;
    use actix_web::ResponseError;

    fn state_with_key() -> web::Data<AppState> {
        let mut config = AppConfig::default();
        config.upstream.api_key = Some("sk-secret".to_string());
        web::Data::new(AppState::new(config))
    }

    #[actix_web::test]
    async fn test_get_config_masks_api_key() {
        let response = get_config(state_with_key()).await.unwrap();
        let body = to_bytes(response.into_body()).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();

        assert!(!text.contains("sk-secret"));
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["config"]["upstream"]["api_key"], "***");
    }

    #[actix_web::test]
    async fn test_update_config_applies_partial_changes() {
        let state = state_with_key();
        let body = web::Json(json!({"session": {"voice": "shimmer"}, "performance": {"max_concurrent_sessions": 3}}));

        let response = update_config(state.clone(), body).await.unwrap();
        assert!(response.status().is_success());

        let config = state.get_config();
        assert_eq!(config.session.voice, "shimmer");
        assert_eq!(config.performance.max_concurrent_sessions, 3);
        assert_eq!(config.upstream.api_key.as_deref(), Some("sk-secret"));
    }

    #[actix_web::test]
    async fn test_update_config_rejects_invalid_values() {
        let state = state_with_key();
        let body = web::Json(json!({"audio": {"encode_chunk_bytes": 1000}}));

        let err = update_config(state.clone(), body).await.unwrap_err();
        assert_eq!(err.status_code(), actix_web::http::StatusCode::BAD_REQUEST);
        assert_ne!(state.get_config().audio.encode_chunk_bytes, 1000);
    }
}
