// Router configuration

use axum::{
    Router,
    http::Method,
    routing::{delete, get, post},
};
use tower_http::{
    cors::{AllowHeaders, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    handlers::{
        document_handlers::{get_document_content_handler, update_document_handler},
        health_handlers::{get_presence_handler, health_handler},
        queue_handlers::{
            clear_queues_handler, failed_jobs_handler, queue_stats_handler,
            retry_failed_job_handler,
        },
    },
    state::AppState,
    ws::ws_handler,
};

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true);

    Router::new()
        // Health & operator views
        .route("/health", get(health_handler))
        .route("/presence/{document_id}", get(get_presence_handler))
        // Realtime plane
        .route("/ws", get(ws_handler))
        // Persistence intake
        .route("/documents/{document_id}", post(update_document_handler))
        .route(
            "/documents/{document_id}/content",
            get(get_document_content_handler),
        )
        // Queue administration
        .route("/queue/stats", get(queue_stats_handler))
        .route("/queue/failed", get(failed_jobs_handler))
        .route("/queue/failed/{job_id}/retry", post(retry_failed_job_handler))
        .route("/queue", delete(clear_queues_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
