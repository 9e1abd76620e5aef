use std::sync::Arc;

#[tokio::main]
async fn main() {
    finsight_observability::init();

    let services = Arc::new(
        finsight_api::app::AppServices::from_env()
            .await
            .expect("failed to initialize services"),
    );
    let app = finsight_api::app::build_app(services);

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {addr}: {e}"));

    tracing::info!("listening on {}", listener.local_addr().unwrap());

    axum::serve(listener, app).await.unwrap();
}
