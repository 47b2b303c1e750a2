//! HTTP surface of the operator process: Prometheus metrics on the metrics
//! address, liveness/readiness probes on the probe address.

use actix_web::{get, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder};
use prometheus::{Encoder, Registry, TextEncoder};

#[get("/metrics")]
async fn metrics(registry: Data<Registry>, _req: HttpRequest) -> impl Responder {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&families, &mut buffer) {
        Ok(()) => HttpResponse::Ok().body(buffer),
        Err(e) => HttpResponse::InternalServerError().body(e.to_string()),
    }
}

#[get("/healthz")]
async fn healthz(_req: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("ok")
}

#[get("/readyz")]
async fn readyz(_req: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("ok")
}

/// Serve both endpoints until shutdown.
pub async fn serve(metrics_addr: String, probe_addr: String, registry: Registry) -> anyhow::Result<()> {
    let registry = Data::new(registry);

    let metrics_server = HttpServer::new({
        let registry = registry.clone();
        move || App::new().app_data(registry.clone()).service(metrics)
    })
    .bind(metrics_addr)?
    .shutdown_timeout(5)
    .run();

    let probe_server = HttpServer::new(|| App::new().service(healthz).service(readyz))
        .bind(probe_addr)?
        .shutdown_timeout(5)
        .run();

    let (metrics_result, probe_result) = tokio::join!(metrics_server, probe_server);
    metrics_result?;
    probe_result?;
    Ok(())
}
