use crate::{config::AppConfig, error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// The configuration as JSON with the chat API key masked.
fn redacted(config: &AppConfig) -> Result<serde_json::Value, AppError> {
    let mut value = serde_json::to_value(config)?;
    if let Some(key) = value.pointer_mut("/engines/chat/api_key") {
        if !key.is_null() {
            *key = json!("***");
        }
    }
    Ok(value)
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": redacted(&config)?
    })))
}

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

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated, session and engine changes apply after restart",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": redacted(&current_config)?
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::testing::Fakes;
    use crate::state::tests::app_state;
    use actix_web::{http::StatusCode, test, App};

    #[actix_web::test]
    async fn test_partial_update_and_validation() {
        let state = web::Data::new(app_state(&Fakes::new()));
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/config", web::get().to(get_config))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"session": {"timeout_secs": 120}}))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["updated_config"]["session"]["timeout_secs"], 120);
        assert_eq!(state.get_config().session.timeout_secs, 120);
        assert_eq!(state.get_config().server.port, 8080);

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"server": {"port": 0}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.get_config().server.port, 8080);
    }

    #[actix_web::test]
    async fn test_api_key_is_masked() {
        let state = web::Data::new(app_state(&Fakes::new()));
        let mut config = state.get_config();
        config.engines.chat.api_key = Some("sk-secret".to_string());
        state.update_config(config).unwrap();

        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/config", web::get().to(get_config)),
        )
        .await;
        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/config").to_request()).await;
        assert_eq!(body["config"]["engines"]["chat"]["api_key"], "***");
    }
}
