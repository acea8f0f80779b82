//! # Liveness and Status Endpoints
//!
//! - `GET /heartbeat`: the literal `asr`, which the legacy load balancer polls for
//! - `GET /health`: service identity plus the configured recognition chain
//! - `GET /metrics`: counters since process start, per-endpoint timing and memory

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub const HEARTBEAT_BODY: &str = "asr";

pub async fn heartbeat() -> HttpResponse {
    HttpResponse::Ok().content_type("text/plain").body(HEARTBEAT_BODY)
}

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = &state.config;

    let status = if state.gateway.is_empty() { "degraded" } else { "healthy" };

    HttpResponse::Ok().json(json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port,
            "endpoint": config.nmsp.endpoint_path
        },
        "recognition": {
            "configured": config.recognition.backends,
            "active": state.gateway.backend_names(),
            "timeout_secs": state.gateway.timeout().as_secs()
        },
        "audio": {
            "codec": state.codecs.kind(),
            "gain": config.audio.gain,
            "idle_codecs": state.codecs.idle_count()
        },
        "recording": {
            "enabled": state.recorder.is_some(),
            "directory": state.recorder.as_ref().map(|r| r.directory().display().to_string())
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate()
        }
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate(),
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "recognition": {
            "recognitions": metrics.recognitions,
            "retries": metrics.retries,
            "transcription_failures": metrics.transcription_failures,
            "backend_failures": metrics.backend_failures
        },
        "frames": {
            "received": metrics.frames_received,
            "decoded": metrics.frames_decoded,
            "skipped": metrics.frames_skipped
        },
        "endpoints": endpoint_stats,
        "memory": get_memory_info()
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", process::id())) {
            let field = |name: &str| -> u64 {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .unwrap_or(0)
                    * 1024
            };

            return json!({
                "resident_memory_bytes": field("VmRSS:"),
                "virtual_memory_bytes": field("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "pid": process::id()
    })
}

#[cfg(test)]
mod tests {
    use crate::recognition::testing::StaticBackend;
    use crate::state::testing::state_with_backends;
    use actix_web::http::StatusCode;
    use actix_web::{test, web, App};

    #[actix_web::test]
    async fn test_heartbeat_body() {
        let state = state_with_backends(Vec::new());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(|cfg| crate::handlers::configure(cfg, "/NmspServlet/")),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/heartbeat").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(test::read_body(resp).await, web::Bytes::from_static(b"asr"));
    }

    #[actix_web::test]
    async fn test_health_lists_active_backends() {
        let state = state_with_backends(vec![StaticBackend::replying("static", "hi")]);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(|cfg| crate::handlers::configure(cfg, "/NmspServlet/")),
        )
        .await;

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/health").to_request()).await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"]["name"], "nmsp-gateway");
        assert_eq!(body["recognition"]["active"][0], "static");
        assert_eq!(body["audio"]["codec"], "pcm16");
        assert_eq!(body["recording"]["enabled"], false);
    }

    #[actix_web::test]
    async fn test_metrics_report_recognition_counters() {
        let state = state_with_backends(Vec::new());
        state.record_recognition(crate::state::RecognitionOutcome::Retry, 2);

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(|cfg| crate::handlers::configure(cfg, "/NmspServlet/")),
        )
        .await;

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/metrics").to_request()).await;

        assert_eq!(body["recognition"]["retries"], 1);
        assert_eq!(body["recognition"]["backend_failures"], 2);
        assert!(body["memory"]["resident_memory_bytes"].is_u64());
    }
}
