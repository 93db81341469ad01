//! trafficd - traffic density dashboard daemon
//!
//! This daemon:
//! 1. Loads configuration (JSON file + env overrides)
//! 2. Initializes the detector backend once at startup
//! 3. Opens the single-slot upload store
//! 4. Serves the dashboard, map, and upload API until interrupted

use anyhow::{anyhow, Result};

use traffic_monitor::api::{ApiConfig, ApiServer};
use traffic_monitor::config::TrafficdConfig;
use traffic_monitor::{
    BackendRegistry, DetectorBackend, StubBackend, TrafficAnalyzer, UploadSlot,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = TrafficdConfig::load()?;

    let mut registry = BackendRegistry::new();
    registry.register(StubBackend::new());

    #[cfg(feature = "backend-tract")]
    if let Some(model_path) = &cfg.detector.model_path {
        let backend = traffic_monitor::TractBackend::new(model_path, cfg.detector.input_size)?
            .with_confidence_threshold(cfg.detector.confidence_threshold)
            .with_iou_threshold(cfg.detector.iou_threshold);
        registry.register(backend);
        log::info!("loaded detection model from {}", model_path.display());
    }

    registry.set_default(&cfg.detector.backend)?;
    log::info!(
        "detector backends: {:?}, default '{}'",
        registry.list(),
        cfg.detector.backend
    );

    let backend = registry
        .default_backend()
        .ok_or_else(|| anyhow!("no detector backend registered"))?;
    {
        let mut guard = backend
            .lock()
            .map_err(|_| anyhow!("detector backend lock poisoned"))?;
        guard.warm_up()?;
        log::info!("detector backend '{}' ready", guard.name());
    }

    let slot = UploadSlot::open(&cfg.upload_dir)?;
    log::info!(
        "uploads stored in {} (single slot, previous image is destroyed)",
        slot.dir().display()
    );

    let analyzer = TrafficAnalyzer::new(backend);
    let api_config = ApiConfig {
        addr: cfg.api_addr.clone(),
        max_upload_bytes: cfg.max_upload_bytes,
    };
    let handle = ApiServer::new(api_config, analyzer, slot).spawn()?;
    log::info!("trafficd listening on {}", handle.addr);
    log::info!(
        "dashboard http://{}/ map http://{}/map",
        handle.addr,
        handle.addr
    );

    let (stop_tx, stop_rx) = std::sync::mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })?;
    stop_rx.recv()?;

    log::info!("shutting down");
    handle.stop()?;
    Ok(())
}
