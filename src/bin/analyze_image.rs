//! analyze_image - one-shot traffic analysis for a single image file.
//!
//! Prints the same JSON record the upload endpoint returns, without
//! running the daemon. Useful for calibrating models against stored
//! camera frames.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use clap::Parser;

use traffic_monitor::{DetectorBackend, StubBackend, TrafficAnalyzer};

#[derive(Parser, Debug)]
#[command(
    name = "analyze_image",
    about = "Count vehicles in a traffic-camera image and recommend a green-light duration"
)]
struct Args {
    /// Image file to analyze (jpg or png)
    image: PathBuf,

    /// ONNX model path (requires the backend-tract feature; the stub
    /// backend is used when omitted)
    #[arg(long, env = "TRAFFIC_MODEL_PATH")]
    model: Option<PathBuf>,

    /// Model input size in pixels
    #[cfg(feature = "backend-tract")]
    #[arg(long, default_value_t = 640)]
    input_size: u32,

    /// Minimum detection confidence
    #[cfg(feature = "backend-tract")]
    #[arg(long, default_value_t = 0.25)]
    confidence: f32,

    /// Print raw detections instead of the analysis summary
    #[arg(long)]
    raw: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let backend = build_backend(&args)?;

    if args.raw {
        let image = traffic_monitor::ingest::load_image(&args.image)?;
        let detections = {
            let mut guard = backend
                .lock()
                .map_err(|_| anyhow::anyhow!("detector backend lock poisoned"))?;
            guard.detect(image.pixels(), image.width, image.height)?
        };
        println!("{}", serde_json::to_string_pretty(&detections)?);
        return Ok(());
    }

    let analyzer = TrafficAnalyzer::new(backend);
    let result = analyzer.analyze_path(&args.image)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[cfg(feature = "backend-tract")]
fn build_backend(args: &Args) -> Result<Arc<Mutex<dyn DetectorBackend>>> {
    if let Some(model) = &args.model {
        let backend = traffic_monitor::TractBackend::new(model, args.input_size)?
            .with_confidence_threshold(args.confidence);
        return Ok(Arc::new(Mutex::new(backend)));
    }
    log::warn!("no model path given; using the stub backend");
    Ok(Arc::new(Mutex::new(StubBackend::new())))
}

#[cfg(not(feature = "backend-tract"))]
fn build_backend(args: &Args) -> Result<Arc<Mutex<dyn DetectorBackend>>> {
    if args.model.is_some() {
        anyhow::bail!("model path given, but this build lacks the backend-tract feature");
    }
    Ok(Arc::new(Mutex::new(StubBackend::new())))
}
