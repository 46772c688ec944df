//! cyto-viewer - A tile server for multi-layer cytology slides.
//!
//! This binary starts the HTTP server and configures all components.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cyto_viewer::{
    compute::rgba_len,
    config::{Cli, Command, ProbeConfig, ServeConfig},
    server::{create_router, AppState, RouterConfig, SessionAuth},
    slide::{CaptureStore, ChainedArchive, FsSlideArchive},
    tile::{PipelineSettings, TileCache, TilePipeline},
    BufferPool, ColorMatrix, CpuBackend, DeviceClient, ScannerSession,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(config) => run_serve(config).await,
        Command::Probe(config) => run_probe(config).await,
    }
}

// =============================================================================
// Serve Command
// =============================================================================

async fn run_serve(config: ServeConfig) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let version = env!("CARGO_PKG_VERSION");
    info!("cyto-viewer v{}", version);
    info!("Configuration:");
    info!("  Storage: {}", config.storage_path.display());
    info!(
        "  Cache: {}MB tiles, {} pool buffers, {} batch workers",
        config.cache_size_mb, config.pool_buffers, config.batch_workers
    );
    info!(
        "  Pixels: {}px tiles, color correction {}, sharpen {}",
        config.tile_size,
        if config.color_correction { "on" } else { "off" },
        config
            .sharpen_amount
            .map_or_else(|| "off".to_string(), |a| a.to_string())
    );

    if config.auth_enabled {
        info!("  Auth: enabled");
        if config.auth_password.is_none() {
            warn!("  Auth: no password configured - any password logs in");
        }
    } else {
        warn!("  Auth: DISABLED - all endpoints are publicly accessible");
        warn!("        Enable for production: --auth-enabled --auth-secret=<secret>");
    }

    if !config.storage_path.is_dir() {
        warn!(
            "  Storage path {} does not exist; only captured slides will be served",
            config.storage_path.display()
        );
    }

    // Slide sources: recent captures first, then the pre-cut archive
    let captures = Arc::new(CaptureStore::new(config.capture_slides));
    let archive = ChainedArchive::new(
        Arc::clone(&captures),
        FsSlideArchive::new(&config.storage_path),
    );

    let settings = PipelineSettings {
        color_matrix: config
            .color_correction
            .then(ColorMatrix::scanner_default),
        sharpen_amount: config.sharpen_amount,
    };
    let pipeline = TilePipeline::new(
        archive,
        TileCache::with_capacity(config.cache_capacity_bytes()),
        BufferPool::new(
            config.pool_buffers,
            rgba_len(config.tile_size, config.tile_size),
        ),
        Arc::new(CpuBackend::new()),
    )
    .with_settings(settings);
    info!("  Compute backend: {}", pipeline.backend_name());

    let mut state = AppState::new(pipeline, captures)
        .with_batch_workers(config.batch_workers)
        .with_tile_size(config.tile_size);

    if config.device_enabled {
        let device = match config.device.settings() {
            Ok(device) => device,
            Err(e) => {
                error!("Configuration error: {}", e);
                return ExitCode::FAILURE;
            }
        };
        info!("  Device: {} {}", device.transport, device.address);
        state = state.with_scanner(
            ScannerSession::new(device).with_scan_deadline(config.scan_deadline()),
        );
    } else {
        info!("  Device: disabled");
    }

    let router = create_router(state, build_router_config(&config));

    let addr = config.bind_address();

    info!("");
    info!("────────────────────────────────────────────────────────────────");
    info!("  Server listening on: http://{}", addr);
    info!("");
    info!("  Try these endpoints:");
    info!("    curl http://{}/health", addr);
    info!("    curl http://{}/api/system/stats", addr);
    if !config.auth_enabled {
        info!("");
        info!("  Fetch a tile directly:");
        info!(
            "    curl 'http://{}/api/tiles/<slide_id>?layer=0&x=0&y=0&z=0'",
            addr
        );
    }
    info!("────────────────────────────────────────────────────────────────");
    info!("");

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = axum::serve(listener, router).await {
        error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "cyto_viewer=debug,tower_http=debug"
    } else {
        "cyto_viewer=info,tower_http=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Build RouterConfig from the application ServeConfig.
fn build_router_config(config: &ServeConfig) -> RouterConfig {
    let mut router_config = match (config.auth_enabled, &config.auth_secret) {
        (true, Some(secret)) => {
            let mut auth = SessionAuth::new(secret).with_ttl(config.token_ttl());
            if let Some(ref password) = config.auth_password {
                auth = auth.with_password(password);
            }
            RouterConfig::new(auth)
        }
        _ => RouterConfig::without_auth(),
    };

    if let Some(ref origins) = config.cors_origins {
        router_config = router_config.with_cors_origins(origins.clone());
    }

    router_config.with_tracing(!config.no_tracing)
}

// =============================================================================
// Probe Command
// =============================================================================

async fn run_probe(config: ProbeConfig) -> ExitCode {
    if config.verbose {
        init_logging(true);
    }

    println!("cyto-viewer Device Probe");
    println!("════════════════════════");
    println!();

    let settings = match config
        .device
        .validate()
        .and_then(|_| config.device.settings())
    {
        Ok(settings) => {
            println!("✓ Device: {} {}", settings.transport, settings.address);
            settings
        }
        Err(e) => {
            println!("✗ Device: {}", e);
            return ExitCode::FAILURE;
        }
    };

    print!("Connecting... ");
    let mut client = match DeviceClient::connect(&settings).await {
        Ok(client) => {
            println!("✓ connected");
            client
        }
        Err(e) => {
            println!("✗ failed");
            println!();
            println!("Error: {}", e);
            println!();
            println!("Please check:");
            println!("  - The device is powered on and reachable");
            println!("  - The protocol and address are correct");
            return ExitCode::FAILURE;
        }
    };

    println!();
    println!("Focus layers:");
    println!("─────────────");
    match client.query_layer_info().await {
        Ok(layers) if layers.is_empty() => println!("  (no layers reported)"),
        Ok(layers) => {
            for layer in &layers {
                println!(
                    "  {:>3}  {}x{}  {:.2}µm  tile {}px",
                    layer.layer_index,
                    layer.width,
                    layer.height,
                    layer.focus_depth_microns,
                    layer.tile_size_pixels
                );
            }
            println!();
            println!("Total: {} layer(s)", layers.len());
        }
        Err(e) => {
            println!("  Error reading layers: {}", e);
            return ExitCode::FAILURE;
        }
    }

    println!();
    print!("Status... ");
    let status = client.status().await;
    client.close().await;

    match status {
        Ok(status) => {
            println!("✓");
            println!("  Ready: {}", status.ready);
            println!("  Temperature: {:.2}°C", status.temperature_celsius);
            println!("  Current layer: {}", status.current_layer);
            if status.error_code != 0 {
                println!("  Error code: {}", status.error_code);
            }
        }
        Err(e) => {
            println!("✗ {}", e);
            return ExitCode::FAILURE;
        }
    }

    println!();
    println!("════════════════════════");
    println!("✓ Device is responding");

    ExitCode::SUCCESS
}
