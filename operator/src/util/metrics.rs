use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use owo_colors::OwoColorize;
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, TextEncoder,
};
use std::convert::Infallible;
use std::sync::OnceLock;
use tokio::net::TcpListener;

lazy_static! {
    /// Last-value gauge exposing how many tokens the client rate limiter
    /// has left, tagged by client name.
    static ref CLIENT_TOKENS_REMAINING: GaugeVec = GaugeVec::new(
        Opts::new(
            "k8s_client_tokens_remaining",
            "Tokens left in the kubernetes client rate limiter",
        ),
        &["client"],
    )
    .unwrap();
}

static SERVER_STARTED: OnceLock<()> = OnceLock::new();

pub fn set_client_tokens_remaining(client: &str, tokens: f64) {
    CLIENT_TOKENS_REMAINING
        .with_label_values(&[client])
        .set(tokens);
}

/// Per-controller reconcile bookkeeping.
pub struct ControllerMetrics {
    pub reconcile_counter: IntCounterVec,
    pub error_counter: IntCounterVec,
    pub reconcile_histogram: HistogramVec,
}

impl ControllerMetrics {
    pub fn new(controller: &str) -> Self {
        let reconcile_counter = IntCounterVec::new(
            Opts::new(
                format!("{controller}_reconciles_total"),
                format!("Total reconciles performed by the {controller} controller"),
            ),
            &["node"],
        )
        .unwrap();
        let error_counter = IntCounterVec::new(
            Opts::new(
                format!("{controller}_reconcile_errors_total"),
                format!("Reconcile failures in the {controller} controller"),
            ),
            &["node"],
        )
        .unwrap();
        let reconcile_histogram = HistogramVec::new(
            HistogramOpts::new(
                format!("{controller}_reconcile_duration_seconds"),
                format!("Reconcile latency of the {controller} controller"),
            ),
            &["node"],
        )
        .unwrap();
        let registry = prometheus::default_registry();
        registry.register(Box::new(reconcile_counter.clone())).ok();
        registry.register(Box::new(error_counter.clone())).ok();
        registry
            .register(Box::new(reconcile_histogram.clone()))
            .ok();
        Self {
            reconcile_counter,
            error_counter,
            reconcile_histogram,
        }
    }
}

/// Starts the metrics endpoint when METRICS_PORT is set. Also installs a
/// panic hook that exits the whole process so the supervisor restarts the
/// container instead of running with a dead task.
pub fn maybe_spawn_metrics_server() {
    let Some(port) = metric_port_env() else {
        return;
    };
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    // Only start the HTTP server once even if this is called multiple times.
    if SERVER_STARTED.set(()).is_ok() {
        prometheus::default_registry()
            .register(Box::new(CLIENT_TOKENS_REMAINING.clone()))
            .ok();
        tokio::spawn(run_metrics_server(port));
    }
}

pub async fn run_metrics_server(port: u16) {
    let addr = format!("0.0.0.0:{}", port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("🛑 Failed to bind metrics server to {}: {}", addr, e);
            return;
        }
    };
    println!(
        "{}{}",
        "📈 Starting metrics server • port=".green(),
        format!("{}", port).green().dimmed(),
    );
    let shutdown = node_lifecycle_common::shutdown::shutdown_token();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                println!("{}", "🛑 Metrics server stopped".red());
                break;
            }
            accepted = listener.accept() => {
                let Ok((stream, _)) = accepted else { continue };
                tokio::spawn(async move {
                    http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service_fn(serve))
                        .await
                        .ok();
                });
            }
        }
    }
}

async fn serve(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/metrics" => {
            let mut buf = Vec::new();
            TextEncoder::new().encode(&prometheus::gather(), &mut buf).ok();
            Response::new(Full::new(Bytes::from(buf)))
        }
        "/healthz" | "/readyz" => Response::new(Full::new(Bytes::from_static(b"ok"))),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new()))
            .unwrap(),
    };
    Ok(response)
}

fn metric_port_env() -> Option<u16> {
    std::env::var("METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
}
