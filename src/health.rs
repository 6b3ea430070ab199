use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let sessions = state.registry.snapshot();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "active_sessions": sessions.active_sessions
        },
        "memory": get_memory_info(),
        "engines": {
            "chat": if config.engines.chat.api_key.is_some() { "http" } else { "echo" },
            "chat_model": config.engines.chat.model,
            "transcription": "local",
            "synthesis": "local"
        },
        "system": get_system_status(sessions.active_sessions, config.session.max_concurrent_sessions)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let config = state.get_config();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "sessions": state.registry.snapshot(),
        "endpoints": endpoint_stats,
        "memory": get_memory_info(),
        "limits": {
            "max_concurrent_sessions": config.session.max_concurrent_sessions,
            "session_timeout_secs": config.session.timeout_secs,
            "max_text_message_chars": config.session.max_text_message_chars
        }
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", std::process::id())) {
            let read_kb = |prefix: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(prefix))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .unwrap_or(0)
                    * 1024
            };

            return json!({
                "resident_memory_bytes": read_kb("VmRSS:"),
                "virtual_memory_bytes": read_kb("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

fn get_system_status(active_sessions: usize, max_sessions: usize) -> serde_json::Value {
    let session_usage = if max_sessions > 0 {
        active_sessions as f64 / max_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": max_sessions,
        "current_sessions": active_sessions,
        "load_warnings": if session_usage > 0.8 {
            vec!["High session usage - consider increasing session.max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::testing::Fakes;
    use crate::state::tests::app_state;
    use actix_web::{test as actix_test, App};

    #[test]
    fn test_system_status_thresholds() {
        assert_eq!(get_system_status(0, 100)["status"], "normal");
        assert_eq!(get_system_status(75, 100)["status"], "moderate_load");
        assert_eq!(get_system_status(95, 100)["status"], "high_load");
        assert_eq!(get_system_status(85, 100)["load_warnings"].as_array().unwrap().len(), 1);
    }

    #[actix_web::test]
    async fn test_health_reports_sessions() {
        let state = web::Data::new(app_state(&Fakes::new()));
        let app = actix_test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/health", web::get().to(health_check))
                .route("/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let body: serde_json::Value =
            actix_test::call_and_read_body_json(&app, actix_test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["metrics"]["active_sessions"], 0);
        assert_eq!(body["engines"]["chat"], "echo");

        let body: serde_json::Value =
            actix_test::call_and_read_body_json(&app, actix_test::TestRequest::get().uri("/metrics").to_request()).await;
        assert_eq!(body["sessions"]["sessions_created"], 0);
        assert_eq!(body["limits"]["session_timeout_secs"], 300);
    }
}
