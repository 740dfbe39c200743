use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api_rest::{AppState, router};
use relay_certificates::{CA_CERT_FILE, write_tls_bundle};
use relay_core::config::{
    bytes_from_env_value, duration_from_env_value, forward_mode_from_env_value,
    optional_from_env_value, poll_interval_from_env_value,
};
use relay_core::constants::{DEFAULT_CERT_DIR, DEFAULT_DATA_DIR};
use relay_core::{
    DocumentIntake, Endpoints, ForwardMode, LocalRecordStore, Pipeline, RelayConfig, Timing,
};
use relay_files::{PipelineStore, ScratchStore};
use relay_transport::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_FRAME_BYTES, DEFAULT_READ_TIMEOUT, Forwarder, HopRole,
    HopServer, HopServerConfig, HttpHop, TcpHop, TcpHopConfig, TlsPaths,
};

type Workflow = Pipeline<LocalRecordStore, dyn Forwarder>;

/// Main entry point for the HL7 relay
///
/// Runs, in one process:
/// - the HTTP ingress (default 0.0.0.0:8080)
/// - the relay TCP hop (default 0.0.0.0:8081), forwarding to `RELAY_NEXT_HOP`
/// - an optional terminal TCP hop
/// - the folder poller driving the ingestion workflow
///
/// # Environment Variables
/// - `RELAY_DATA_DIR`: Root of the pipeline folders (default: "relay_data")
/// - `RELAY_CERT_DIR`: Directory holding the mutual TLS bundle (default: "keys")
/// - `RELAY_DEV_CERTS`: Generate a development bundle when none exists
/// - `RELAY_HTTP_BIND`: HTTP ingress address (default: "0.0.0.0:8080")
/// - `RELAY_TCP_BIND`: Relay hop address, empty to disable (default: "0.0.0.0:8081")
/// - `RELAY_NEXT_HOP`: Where the relay hop forwards to (default: "127.0.0.1:8082")
/// - `RELAY_TERMINAL_BIND`: Terminal hop address (default: disabled)
/// - `RELAY_FORWARD_TO`: TCP hop used by the workflow and `/hl7/tcp` (default: "127.0.0.1:8081")
/// - `RELAY_SERVER_NAME`: Name the hop certificates are valid for (default: "localhost")
/// - `RELAY_HTTP_SINK_URL`: Third-party HTTP sink for `/hl7/http`
/// - `RELAY_FORWARD_MODE`: `tcp` or `http` (default: "tcp")
/// - `RELAY_POLL_INTERVAL`, `RELAY_CONNECT_TIMEOUT`, `RELAY_READ_TIMEOUT`: durations such as
///   `30`, `30s` or `500ms`; a poll interval of `0` or `off` disables polling
/// - `RELAY_MAX_FRAME_BYTES`: Largest accepted TCP payload (default: 1 MiB)
///
/// # Errors
/// Returns an error if:
/// - the configuration is invalid,
/// - the data or certificate directory cannot be prepared,
/// - a listener cannot be bound, or
/// - a server fails while running.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("relay_run=info".parse()?)
                .add_directive("relay_core=info".parse()?)
                .add_directive("relay_transport=info".parse()?)
                .add_directive("relay_files=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = resolve_config()?;

    if flag_from_env_value(env("RELAY_DEV_CERTS")) && !cfg.cert_dir().join(CA_CERT_FILE).exists() {
        let bundle = write_tls_bundle(cfg.cert_dir())?;
        tracing::warn!(ca_cert = %bundle.ca_cert.display(), "generated development TLS bundle");
    }

    let store = PipelineStore::new(cfg.data_dir())?;
    let recovered = store.recover_claims()?;
    if recovered > 0 {
        tracing::warn!(recovered, "returned orphaned claims to their folders");
    }

    let tcp_hop: Arc<dyn Forwarder> = Arc::new(tcp_hop_to(&cfg, &cfg.endpoints().forward_to));
    let http_sink: Arc<dyn Forwarder> = Arc::new(HttpHop::with_timeout(
        &cfg.endpoints().http_sink_url,
        cfg.timing().read_timeout,
    )?);
    let forwarder = match cfg.forward_mode() {
        ForwardMode::Tcp => tcp_hop.clone(),
        ForwardMode::Http => http_sink.clone(),
    };
    tracing::info!(hop = %forwarder.describe(), "workflow forwarding");

    let workflow: Arc<Workflow> = Arc::new(Pipeline::new(
        store,
        Arc::new(LocalRecordStore::new(cfg.records_dir())),
        forwarder,
    ));

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut tasks = tokio::task::JoinSet::new();

    let app = router(AppState {
        tcp_hop,
        http_sink,
        intake: workflow.clone() as Arc<dyn DocumentIntake>,
        scratch: ScratchStore::new(&cfg.scratch_dir())?,
    });
    let listener = tokio::net::TcpListener::bind(&cfg.endpoints().http_bind).await?;
    tracing::info!("++ Starting HL7 relay HTTP ingress on {}", listener.local_addr()?);
    let stop = stopped(stop_rx.clone());
    tasks.spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(stop)
            .await
            .map_err(anyhow::Error::from)
    });

    if let Some(bind) = &cfg.endpoints().relay_bind {
        let next: Arc<dyn Forwarder> = Arc::new(tcp_hop_to(&cfg, &cfg.endpoints().relay_next_hop));
        let server = HopServer::bind(hop_config(&cfg, bind), HopRole::Relay { next }).await?;
        let stop = stopped(stop_rx.clone());
        tasks.spawn(async move { server.run_until(stop).await.map_err(anyhow::Error::from) });
    }

    if let Some(bind) = &cfg.endpoints().terminal_bind {
        let server = HopServer::bind(hop_config(&cfg, bind), HopRole::Terminal).await?;
        let stop = stopped(stop_rx.clone());
        tasks.spawn(async move { server.run_until(stop).await.map_err(anyhow::Error::from) });
    }

    if let Some(interval) = cfg.timing().poll_interval {
        let stop = stopped(stop_rx.clone());
        tasks.spawn(async move {
            tokio::select! {
                _ = poll(workflow, interval) => {}
                _ = stop => {}
            }
            Ok(())
        });
    } else {
        tracing::info!("folder polling disabled");
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("-- Shutting down HL7 relay"),
        Some(finished) = tasks.join_next() => {
            finished??;
            tracing::warn!("a service stopped unexpectedly, shutting down");
        }
    }

    stop_tx.send(true).ok();
    while let Some(finished) = tasks.join_next().await {
        finished??;
    }

    Ok(())
}

/// Resolves the relay configuration from the environment.
fn resolve_config() -> anyhow::Result<RelayConfig> {
    let endpoints = Endpoints {
        http_bind: env("RELAY_HTTP_BIND").unwrap_or_else(|| "0.0.0.0:8080".into()),
        relay_bind: match env("RELAY_TCP_BIND") {
            None => Some("0.0.0.0:8081".into()),
            set => optional_from_env_value(set),
        },
        relay_next_hop: env("RELAY_NEXT_HOP").unwrap_or_else(|| "127.0.0.1:8082".into()),
        terminal_bind: optional_from_env_value(env("RELAY_TERMINAL_BIND")),
        forward_to: env("RELAY_FORWARD_TO").unwrap_or_else(|| "127.0.0.1:8081".into()),
        server_name: env("RELAY_SERVER_NAME").unwrap_or_else(|| "localhost".into()),
        http_sink_url: env("RELAY_HTTP_SINK_URL")
            .unwrap_or_else(|| "http://127.0.0.1:9000/hl7".into()),
    };

    let timing = Timing {
        poll_interval: poll_interval_from_env_value(env("RELAY_POLL_INTERVAL"))?,
        connect_timeout: duration_from_env_value(
            env("RELAY_CONNECT_TIMEOUT"),
            DEFAULT_CONNECT_TIMEOUT,
        )?,
        read_timeout: duration_from_env_value(env("RELAY_READ_TIMEOUT"), DEFAULT_READ_TIMEOUT)?,
        max_frame_bytes: bytes_from_env_value(
            env("RELAY_MAX_FRAME_BYTES"),
            DEFAULT_MAX_FRAME_BYTES,
        )?,
    };

    let cfg = RelayConfig::new(
        dir_from_env("RELAY_DATA_DIR", DEFAULT_DATA_DIR),
        dir_from_env("RELAY_CERT_DIR", DEFAULT_CERT_DIR),
        endpoints,
        forward_mode_from_env_value(env("RELAY_FORWARD_MODE"))?,
        timing,
    )?;
    Ok(cfg)
}

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn dir_from_env(name: &str, default: &str) -> PathBuf {
    optional_from_env_value(env(name))
        .map(PathBuf::from)
        .unwrap_or_else(|| Path::new(default).to_path_buf())
}

fn flag_from_env_value(value: Option<String>) -> bool {
    value.is_some_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

fn tcp_hop_to(cfg: &RelayConfig, address: &str) -> TcpHop {
    let mut config = TcpHopConfig::new(
        address,
        cfg.endpoints().server_name.clone(),
        TlsPaths::client_in(cfg.cert_dir()),
    );
    config.connect_timeout = cfg.timing().connect_timeout;
    config.read_timeout = cfg.timing().read_timeout;
    config.max_frame_bytes = cfg.timing().max_frame_bytes;
    TcpHop::new(config)
}

fn hop_config(cfg: &RelayConfig, bind: &str) -> HopServerConfig {
    let mut config = HopServerConfig::new(
        bind,
        TlsPaths::server_in(cfg.cert_dir()),
        cfg.scratch_dir(),
    );
    config.handshake_timeout = cfg.timing().connect_timeout;
    config.read_timeout = cfg.timing().read_timeout;
    config.max_frame_bytes = cfg.timing().max_frame_bytes;
    config
}

/// Completes once the stop flag is raised.
async fn stopped(mut rx: watch::Receiver<bool>) {
    rx.wait_for(|stop| *stop).await.ok();
}

/// Drains the intake folders on every tick.
async fn poll(workflow: Arc<Workflow>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        for result in [
            workflow.upload_work_folder().await,
            workflow.process_import_folder().await,
            workflow.dispatch_generated().await,
        ] {
            match result {
                Ok(report) if report.processed() > 0 => tracing::info!(
                    folder = %report.folder,
                    succeeded = report.succeeded,
                    failed = report.failed,
                    "folder drained"
                ),
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "batch failed"),
            }
        }
    }
}
