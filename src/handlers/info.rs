use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Describes the AudioHook endpoint to integrators: where to connect, what
/// audio to send and whether a key is needed.
pub async fn audiohook_info(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let registry = state.registry_summary();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "endpoint": {
            "path": config.gateway.audiohook_path,
            "transport": "websocket",
            "auth_required": !config.auth.api_key.is_empty(),
            "auth_header": "X-API-KEY"
        },
        "media": {
            "format": "PCMU",
            "sample_rate": config.audio.sample_rate,
            "channels": 1,
            "keepalive_interval_ms": config.audio.chunk_duration_ms
        },
        "capacity": {
            "max_concurrent_calls": registry.max_calls,
            "active_calls": registry.active_calls,
            "accepting": registry.active_calls < registry.max_calls
        },
        "monitor_path": config.gateway.monitor_path
    }))
}
