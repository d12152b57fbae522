mod cli;

use anyhow::{Context, Result};
use cli::Args;
use i3d_features::pipeline::i3d::I3dFactory;
use i3d_features::pipeline::orchestrator::{Coordinator, ExtractionReport};
use i3d_features::pipeline::sink::OnExtraction;
use i3d_features::run_context::write_report;
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    let args = Args::parse_args();
    let config = args.extraction_config();
    let videos = args.inputs().resolve()?;
    let factory = I3dFactory::new(args.i3d_config()).context("Invalid model configuration")?;

    let sink = config.on_extraction.sink(&config.output_path);
    let source = Arc::new(config.backend);
    let coordinator = Coordinator::new(config, source, Arc::new(factory), sink);
    tracing::info!(
        "Extracting {} video(s) on {:?}",
        videos.len(),
        coordinator.config().devices
    );

    let cancel = coordinator.cancel_flag();
    ctrlc::set_handler(move || {
        tracing::warn!("Interrupt received, finishing current windows");
        cancel.store(true, Ordering::SeqCst);
    })
    .context("Failed to install Ctrl-C handler")?;

    let report = coordinator.extract(&videos)?;

    let config = coordinator.config();
    if config.on_extraction == OnExtraction::Print {
        print_records(&report);
    }
    let report_path = write_report(&config.output_path, &report)?;
    tracing::info!(
        "{} succeeded, {} failed, report at {}",
        report.succeeded(),
        report.failed(),
        report_path.display()
    );
    Ok(())
}

fn print_records(report: &ExtractionReport) {
    for record in &report.records {
        println!("{} ({:.2} fps)", record.video.display(), record.fps);
        for (stream, features) in &record.features {
            let (rows, dim) = features.dim();
            println!("  {}: {} x {}", stream, rows, dim);
            if let Some(row) = features.rows().into_iter().next() {
                let head: Vec<String> = row.iter().take(5).map(|v| format!("{:.4}", v)).collect();
                println!("    [{}, ...]", head.join(", "));
            }
        }
        println!("  timestamps_ms: {:?}", record.timestamps_ms);
    }
    for failure in &report.failures {
        println!("FAILED {}: {}", failure.video.display(), failure.reason);
    }
}
