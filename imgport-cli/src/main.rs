//! Entry point for the imgport upload server.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use imgport::space::FilesystemOverhead;
use imgport::{Quantity, ServerConfig, TlsMaterial, UploadServer};
use tracing::info;

/// Receives a disk image over HTTP(S) and imports it into the target
/// volume as a RAW image.
#[derive(Parser, Debug)]
#[command(author, version, about = "imgport upload server - import a streamed disk image")]
struct Args {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    listen_address: String,

    /// Port to bind
    #[arg(long, default_value_t = 8443)]
    listen_port: u16,

    /// Target path: a mounted directory or a block device
    #[arg(long)]
    destination: PathBuf,

    /// Scratch directory for uploads that need conversion
    #[arg(long, default_value = "/scratch")]
    scratch_dir: PathBuf,

    /// Requested virtual size of the imported image (e.g. 10Gi)
    #[arg(long)]
    image_size: Option<String>,

    /// Content type of the upload: kubevirt or archive
    #[arg(long, default_value = "kubevirt")]
    content_type: String,

    /// Server TLS private key file (PEM)
    #[arg(long)]
    tls_key_file: Option<PathBuf>,

    /// Server TLS certificate file (PEM)
    #[arg(long)]
    tls_cert_file: Option<PathBuf>,

    /// CA bundle client certificates must chain to (PEM)
    #[arg(long)]
    client_ca_file: Option<PathBuf>,

    /// Required client certificate Common Name
    #[arg(long)]
    expected_client_name: Option<String>,

    /// JSON file with filesystem overhead configuration
    #[arg(long)]
    overhead_config: Option<PathBuf>,

    /// Storage class selecting a per-class overhead value
    #[arg(long)]
    storage_class: Option<String>,

    /// Health listener port (0 disables it)
    #[arg(long, default_value_t = 8080)]
    health_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Respects RUST_LOG, defaults to "info".
    tracing_subscriber::fmt()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = build_config(&args)?;

    info!(
        addr = %format!("{}:{}", config.bind_address, config.bind_port),
        dest = %config.destination.display(),
        "starting upload server"
    );
    let server = UploadServer::new(config);
    server.run().await?;
    info!("import complete");
    Ok(())
}

fn build_config(args: &Args) -> anyhow::Result<ServerConfig> {
    let mut config = ServerConfig::new(
        args.listen_address.clone(),
        args.listen_port,
        &args.destination,
    );
    config.scratch_dir = args.scratch_dir.clone();
    config.health_port = args.health_port;
    config.content_type = args
        .content_type
        .parse()
        .context("invalid --content-type")?;
    if let Some(size) = &args.image_size {
        config.image_size = Some(size.parse::<Quantity>().context("invalid --image-size")?);
    }
    config.expected_client_name = args.expected_client_name.clone();

    config.tls = match (
        &args.tls_key_file,
        &args.tls_cert_file,
        &args.client_ca_file,
    ) {
        (Some(key), Some(cert), Some(ca)) => Some(TlsMaterial {
            key_pem: read_pem(key)?,
            cert_pem: read_pem(cert)?,
            client_ca_pem: read_pem(ca)?,
        }),
        (None, None, None) => None,
        _ => anyhow::bail!(
            "TLS requires --tls-key-file, --tls-cert-file and --client-ca-file together"
        ),
    };

    if let Some(path) = &args.overhead_config {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading overhead config {}", path.display()))?;
        let overhead: FilesystemOverhead = serde_json::from_str(&raw)
            .with_context(|| format!("parsing overhead config {}", path.display()))?;
        config.filesystem_overhead = overhead.for_storage_class(args.storage_class.as_deref());
    }

    Ok(config)
}

fn read_pem(path: &Path) -> anyhow::Result<String> {
    fs::read_to_string(path).with_context(|| format!("reading PEM file {}", path.display()))
}
