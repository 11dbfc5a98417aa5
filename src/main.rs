use axum::{
    routing::{get, post, put},
    Router,
};
use receipt_split_rust::api::{self, AppState};
use receipt_split_rust::jobs::{self, PgReceiptStore, ProcessingContext};
use receipt_split_rust::{create_pool, AppConfig, FileStore, OcrClient, ReceiptService, StatusHub};
use std::sync::Arc;
use tower::ServiceBuilder;
use tracing::info;
use tracing_subscriber::fmt::time::ChronoLocal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Local-time log format
    tracing_subscriber::fmt()
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string()))
        .with_target(true)
        .with_level(true)
        .init();

    // Load configuration
    let config = AppConfig::from_env();
    info!("Starting server with config: {:?}", config);

    // Database pool
    let pool = create_pool(&config.database.url).await?;
    info!("Database pool created");

    // Blob store
    let storage = FileStore::new(&config.storage.root);
    storage.init().await?;

    // Shared collaborators
    let hub = Arc::new(StatusHub::new());
    let service = Arc::new(ReceiptService::new(pool.clone(), storage.clone()));

    // Background workers: the only place OCR happens
    let processing = Arc::new(ProcessingContext {
        pool: pool.clone(),
        store: Arc::new(PgReceiptStore::new(pool.clone())),
        storage: storage.clone(),
        ocr: OcrClient::from_config(&config.ocr),
        hub: hub.clone(),
    });
    let worker_handles = jobs::spawn_workers(processing, &config.jobs);
    info!("Spawned {} receipt workers", worker_handles.len());

    let _cleanup_handle =
        jobs::spawn_cleanup_task(pool.clone(), storage, &config.storage, &config.jobs);

    // Routes
    let state = AppState {
        service,
        hub,
        pool,
    };
    let app = Router::new()
        .route("/health", get(api::handlers::health_check))
        .route("/ws", get(api::ws::ws_handler))
        .route(
            "/api/receipts",
            post(api::handlers::upload_receipt).get(api::handlers::list_receipts),
        )
        .route(
            "/api/receipts/:id",
            get(api::handlers::get_receipt).delete(api::handlers::delete_receipt),
        )
        .route("/api/receipts/:id/items", put(api::handlers::update_items))
        .route(
            "/api/receipts/:id/reprocess",
            post(api::handlers::reprocess_receipt),
        )
        .route(
            "/api/receipts/:id/ocr-debug",
            get(api::handlers::get_ocr_debug),
        )
        .with_state(state)
        .layer(ServiceBuilder::new());

    // Serve
    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Server listening on {}", addr);
    info!("API Endpoints:");
    info!("  POST   /api/receipts                - upload (returns 202 + job id)");
    info!("  GET    /api/receipts                - list (paginated)");
    info!("  GET    /api/receipts/:id            - detail (poll fallback)");
    info!("  PUT    /api/receipts/:id/items      - edit items, recompute total");
    info!("  POST   /api/receipts/:id/reprocess  - requeue a failed receipt");
    info!("  DELETE /api/receipts/:id            - delete receipt + artifacts");
    info!("  GET    /api/receipts/:id/ocr-debug  - raw OCR audit artifact");
    info!("  GET    /ws                          - status push channel");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
