use std::sync::Arc;

use clap::Parser;
use folio_disk::config::CliArgs;
use folio_disk::error::{DiskError, StorageError};
use folio_disk::factory::{DiskFactory, DiskRecord, DiskType};
use folio_disk::server::DiskServer;
use folio_disk::transport::NdjsonTransport;

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    // Logs go to stderr; stdout carries the protocol
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    if let Err(e) = run(args).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: CliArgs) -> Result<(), DiskError> {
    let factory = DiskFactory::new(args.context());

    let disk = match &args.snapshot {
        Some(file) => {
            let json = tokio::fs::read_to_string(file)
                .await
                .map_err(|e| StorageError::from_io(e, &file.display().to_string()))?;
            factory.from_json(&json)?
        }
        None => {
            let disk_type: DiskType = args.disk_type.parse()?;
            match &args.guid {
                Some(guid) => factory.create(&DiskRecord::new(guid.clone(), disk_type), None)?,
                None => factory.create_new(disk_type)?,
            }
        }
    };

    tracing::info!(
        guid = %disk.guid(),
        disk_type = %disk.disk_type(),
        data_dir = ?factory.context().data_dir(),
        "folio-disk worker ready"
    );

    let mut server = DiskServer::new(Arc::new(disk), NdjsonTransport::stdout());
    server.run().await
}
