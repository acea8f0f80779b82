pub mod recognize;

pub use recognize::recognize;

use crate::health;
use actix_web::web;

/// Register every route the gateway serves.
pub fn configure(cfg: &mut web::ServiceConfig, endpoint_path: &str) {
    cfg.route(endpoint_path, web::post().to(recognize))
        .route("/heartbeat", web::get().to(health::heartbeat))
        .route("/health", web::get().to(health::health_check))
        .route("/metrics", web::get().to(health::detailed_metrics));
}
