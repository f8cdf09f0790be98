use hyper::{
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server, StatusCode,
};
use loadsmith_common::Config;
use loadsmith_engine::aggregator::write_records;
use loadsmith_engine::{metrics, PoolStatus, Session, SessionError};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_CONFIG_PATH: &str = "config/loadsmith.yaml";

fn init_production_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().with_target(true))
        .init();

    info!("Production structured logging initialized (JSON)");
}

async fn metrics_handler(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    match req.uri().path() {
        "/health" => Ok(Response::new(Body::from("OK"))),
        "/metrics" => Ok(Response::new(Body::from(metrics::render_metrics()))),
        _ => {
            let mut not_found = Response::new(Body::from("Not Found"));
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            Ok(not_found)
        }
    }
}

async fn run_metrics_server(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    metrics::register_metrics();

    let make_svc =
        make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(metrics_handler)) });

    let server = Server::bind(&addr).serve(make_svc);

    info!(port = port, "Observability server online");

    if let Err(e) = server.await {
        error!(error = %e, "Observability server failed");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_production_logging();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&config_path)?;
    info!(config = %config_path, target_addr = %config.target.address, "Configuration loaded");

    if config.metrics.enabled {
        let port = config.metrics.port;
        tokio::spawn(async move {
            run_metrics_server(port).await;
        });
    }

    let export_dir = PathBuf::from(&config.metrics.export_path);
    let export_format = config.metrics.export_format;

    let session = Session::with_synthetic_payloads(config)?;
    let stop = session.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            stop.cancel();
        }
    });

    let report = match session.run().await {
        Ok(report) => report,
        Err(e @ SessionError::ProbeUnreachable { .. }) | Err(e @ SessionError::PoolExhausted { .. }) => {
            error!(error = %e, "Session aborted before any load was generated");
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };

    if let PoolStatus::Exhausted { attempted } = report.pool_status {
        warn!(attempted, "Connection holding was disabled: no connection could be held");
    }
    if report.workers_aborted > 0 {
        warn!(aborted = report.workers_aborted, "Some workers were aborted during drain");
    }
    for (code, count) in &report.summary.status_codes {
        info!(status_code = *code, count = *count, "Status code tally");
    }
    for (strategy, count) in &report.summary.per_strategy {
        info!(strategy = %strategy, count = *count, "Strategy tally");
    }

    if report.records.is_empty() {
        warn!("No observations to export");
        return Ok(());
    }
    std::fs::create_dir_all(&export_dir)?;
    let file_name = format!(
        "session_{}.{}",
        chrono::Utc::now().format("%Y%m%d_%H%M%S"),
        export_format.extension()
    );
    let path = export_dir.join(file_name);
    let file = std::fs::File::create(&path)?;
    write_records(&report.records, export_format, std::io::BufWriter::new(file))?;
    info!(path = %path.display(), records = report.records.len(), "Metrics exported");

    Ok(())
}
