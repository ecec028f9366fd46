//! Tiffster Worker Entry Point
//!
//! Wires the TIFF decoder, the directory-backed object store and the local
//! stage into an engine, then treats every JSON line on stdin as a page open
//! request: `{"document_id": "scan", "page_number": 4}`. An optional
//! `"container_ref": "fs://containers/scan.tif"` names where to fetch the
//! container from when it is not on disk.

use std::process::ExitCode;
use std::sync::Arc;

use serde::Deserialize;
use tiffster_core::{EngineConfig, PageNumber, RemoteRef, TiffsterResult};
use tiffster_engine::{init_tracing, Engine, TelemetryConfig};
use tiffster_storage::{FsObjectStore, TiffContainerDecoder};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Debug, Deserialize)]
struct OpenRequest {
    document_id: String,
    page_number: PageNumber,
    #[serde(default)]
    container_ref: Option<RemoteRef>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let telemetry_config = TelemetryConfig::from_env();
    if let Err(e) = init_tracing(&telemetry_config) {
        eprintln!("Failed to initialize tracing: {}", e);
        return ExitCode::FAILURE;
    }

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Worker failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> TiffsterResult<()> {
    let config = EngineConfig::from_env()?;
    let engine = Engine::start(
        &config,
        Arc::new(TiffContainerDecoder::new()),
        Arc::new(FsObjectStore::new(&config.remote_dir)),
    )?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let interrupted = loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break true;
            }
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break false,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read stdin");
                break false;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let request: OpenRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed request");
                continue;
            }
        };

        match engine
            .service()
            .open_page_from(
                &request.document_id,
                request.page_number,
                request.container_ref.as_ref(),
            )
            .await
        {
            Ok(descriptors) => {
                let refs: Vec<_> = descriptors
                    .iter()
                    .filter_map(|d| d.remote_ref.as_ref().map(|r| r.to_string()))
                    .collect();
                tracing::info!(
                    document_id = %request.document_id,
                    page = request.page_number,
                    ?refs,
                    "Page opened"
                );
            }
            Err(e) => tracing::error!(
                document_id = %request.document_id,
                page = request.page_number,
                error = %e,
                "Failed to open page"
            ),
        }
    };

    let snapshot = if interrupted {
        engine.shutdown().await?
    } else {
        engine.drain().await?
    };
    tracing::info!(
        received = snapshot.received,
        committed = snapshot.committed,
        aborted = snapshot.aborted,
        "Worker stopped"
    );
    Ok(())
}
