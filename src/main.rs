use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rgbd_recorder::storage::ConcatOutcome;
use rgbd_recorder::{
    create_router, encoder_factory, load_tracks, AppState, Config, DeviceRegistry, MediaTool,
    MediaToolFactory, StoragePipeline,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rgbd-recorder", version, about = "Multi-device RGB-D and pose recorder")]
struct Cli {
    /// Configuration file (extension optional)
    #[arg(short, long, default_value = "config/rgbd-recorder")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server and record connected devices
    Serve,
    /// Rebuild the index from the output root and print it
    Rebuild,
    /// Post-process pending chunks and concatenate finished sessions
    Sweep,
    /// Print finished sessions as timeline tracks
    Timeline,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)?;
    info!("Loaded config: {}", cfg.service.name);
    info!("Output root: {:?}", cfg.storage.root_path);

    let tool: Arc<dyn MediaTool> = Arc::from(MediaToolFactory::create(&cfg.media.program));
    let pipeline = StoragePipeline::new(
        cfg.storage.clone(),
        cfg.recording.chunk_interval_ms as i64,
        tool,
    );

    match cli.command {
        Command::Serve => serve(cfg, pipeline).await,
        Command::Rebuild => {
            let index = pipeline.rebuild_index()?;
            println!("{}", index.to_json()?);
            Ok(())
        }
        Command::Sweep => {
            let (reports, index) = pipeline.sweep_all().await?;
            for report in &reports {
                info!(
                    "{}: {} chunks processed, {} skipped, {} failed",
                    report.device_id,
                    report.processing.processed.len(),
                    report.processing.skipped_small.len(),
                    report.processing.failed.len()
                );
                for (session_id, concat) in &report.sessions {
                    for (stream, outcome) in [
                        ("color", &concat.color),
                        ("depth", &concat.depth),
                        ("pose", &concat.pose),
                    ] {
                        if let ConcatOutcome::Deferred { reason, .. } = outcome {
                            warn!("{}/{} {} deferred: {:?}", report.device_id, session_id, stream, reason);
                        }
                    }
                }
            }
            info!("Index holds {} sessions", index.session_count());
            Ok(())
        }
        Command::Timeline => {
            let index = pipeline.rebuild_index()?;
            let tracks = load_tracks(pipeline.root(), &index)?;
            for track in &tracks {
                println!("{}", track.id);
                for segment in &track.segments {
                    println!(
                        "  {} {}..{} ({} s) [{}]",
                        segment.id,
                        segment.start,
                        segment.end,
                        (segment.end - segment.start) / 1000,
                        segment.pieces.keys().cloned().collect::<Vec<_>>().join(", ")
                    );
                }
            }
            Ok(())
        }
    }
}

async fn serve(cfg: Config, pipeline: StoragePipeline) -> Result<()> {
    let registry = DeviceRegistry::new(
        cfg.storage.root_path.clone(),
        cfg.recording.clone(),
        encoder_factory(&cfg.encoder),
    );
    let sweeper = registry.spawn_sweeper(pipeline.clone());

    // Finish whatever a previous run left behind
    let (reports, index) = pipeline.sweep_all().await?;
    info!(
        "Startup sweep: {} devices, {} sessions indexed",
        reports.len(),
        index.session_count()
    );

    let app = create_router(AppState::new(registry.clone(), pipeline));
    let addr = cfg.http_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .context("HTTP server failed")?;

    registry.disconnect_all().await;
    // Let the sweeper see the final Done events before exiting
    drop(registry);
    match tokio::time::timeout(Duration::from_secs(60), sweeper).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Sweeper task ended abnormally: {}", e),
        Err(_) => warn!("Final sweep did not finish in time; the next start picks it up"),
    }

    Ok(())
}
