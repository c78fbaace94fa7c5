//! Sidecar Injector - mutating admission webhook for Pods

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use sidecar_injector::telemetry::{init_logging, LogFormat};
use sidecar_injector::webhook::{serve, ServerConfig, WebhookState};
use sidecar_injector::{
    FailurePolicy, SidecarConfig, SidecarInjector, DEFAULT_REQUEST_TIMEOUT_MS,
    DEFAULT_SIDECAR_CONFIG_FILE, DEFAULT_TLS_CERT_FILE, DEFAULT_TLS_KEY_FILE,
    DEFAULT_WEBHOOK_PORT,
};

/// Sidecar Injector - inject sidecar containers, volumes and annotations into Pods
#[derive(Parser, Debug)]
#[command(name = "sidecar-injector", version, about, long_about = None)]
struct Cli {
    /// Webhook server port
    #[arg(long, env = "WEBHOOK_PORT", default_value_t = DEFAULT_WEBHOOK_PORT)]
    port: u16,

    /// File containing the x509 certificate for HTTPS
    #[arg(long, env = "TLS_CERT_FILE", default_value = DEFAULT_TLS_CERT_FILE)]
    tls_cert_file: PathBuf,

    /// File containing the x509 private key matching --tls-cert-file
    #[arg(long, env = "TLS_KEY_FILE", default_value = DEFAULT_TLS_KEY_FILE)]
    tls_key_file: PathBuf,

    /// File containing the sidecar injection configuration
    #[arg(long, env = "SIDECAR_CONFIG_FILE", default_value = DEFAULT_SIDECAR_CONFIG_FILE)]
    sidecar_config_file: PathBuf,

    /// What to answer when mutation fails
    ///
    /// `ignore` admits the Pod unmutated; `fail` rejects it. Rejecting blocks
    /// Pod creation whenever the injector misbehaves, so only opt in when
    /// injection is mandatory.
    #[arg(long, env = "FAILURE_POLICY", value_enum, default_value_t = FailurePolicy::Ignore)]
    failure_policy: FailurePolicy,

    /// Deadline for answering a single admission request, in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value_t = DEFAULT_REQUEST_TIMEOUT_MS)]
    request_timeout_ms: u64,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    /// Validate the sidecar config file and exit without serving
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.log_format)?;

    // Install crypto provider before any TLS config is built
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    // The webhook must never serve with a missing or partial config
    let config = SidecarConfig::load(&cli.sidecar_config_file)
        .await
        .with_context(|| {
            format!(
                "Failed to load sidecar config {}",
                cli.sidecar_config_file.display()
            )
        })?;

    if cli.check_config {
        println!("Sidecar config: {}", cli.sidecar_config_file.display());
        println!("Containers: {:?}", config.container_names());
        println!("Volumes: {:?}", config.volume_names());
        println!(
            "Annotations: {:?}",
            config.annotations.keys().collect::<Vec<_>>()
        );
        return Ok(());
    }

    if config.is_empty() {
        tracing::warn!("Sidecar config injects nothing, every Pod will pass through unchanged");
    }

    info!(
        config = %cli.sidecar_config_file.display(),
        containers = ?config.container_names(),
        volumes = ?config.volume_names(),
        annotations = config.annotations.len(),
        failure_policy = ?cli.failure_policy,
        "Loaded sidecar config"
    );

    let injector =
        SidecarInjector::new(Arc::new(config)).with_failure_policy(cli.failure_policy);
    let state = WebhookState::new(injector)
        .with_request_timeout(Duration::from_millis(cli.request_timeout_ms));

    let server = ServerConfig::new(cli.port, cli.tls_cert_file, cli.tls_key_file);
    serve(server, Arc::new(state)).await?;

    Ok(())
}
