// =============================================================================
// FRACTAL HOST - multi-buffered Vulkan frame pipeline with shader hot reload
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  FrameLoop (single control thread)                              │
// │    ├── FrameRing: N slots, each a recorder + FenceGate          │
// │    ├── GeometryBuffers: quad, uploaded once by UploadChannel    │
// │    └── PipelineCell <── ReloadWorker (background thread)        │
// │  Backend: Vulkan (ash) or the headless software device          │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Wait for the slot's previous frame to retire
// 2. Pump window events
// 3. Pick up a newly published pipeline generation
// 4. Record, submit, present
// 5. Signal the slot's fence and rotate
//
// =============================================================================

mod backend;
mod compiler;
mod config;
mod context;
mod fence;
mod frame;
mod frame_loop;
mod pipeline;
mod upload;
mod window;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use backend::{Backend, HeadlessDevice, VulkanBackend, VulkanSettings};
use compiler::{GlslcCompiler, StageKind};
use config::{BackendKind, Config};
use context::EngineContext;
use frame::FrameRing;
use frame_loop::FrameLoop;
use pipeline::{FixedFunction, PipelineBuilder, PipelineReloader, ReloadWorker};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use upload::{GeometryBuffers, Vertex};
use window::{EventSource, ScriptedEvents, WinitWindow};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting fractal host");
    log::info!(
        "Window: {}x{}, {} frames in flight, {:?} backend",
        config.window.width,
        config.window.height,
        config.graphics.frames_in_flight,
        config.graphics.backend
    );

    let result = match config.graphics.backend {
        BackendKind::Vulkan => run_windowed(&config),
        BackendKind::Headless => run_headless(&config),
    };

    if let Err(e) = &result {
        log::error!("Fatal: {:#}", e);
    }
    result
}

/// Initialize logging, optionally into a log file
fn init_logging(config: &Config) {
    use env_logger::{Builder, Env, Target};

    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));

    if config.debug.log_to_file {
        match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "=== Fractal Host Log ===");
                let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
                let _ = writeln!(file);
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot open {}: {}", config.debug.log_file, e),
        }
    }

    builder.init();
}

// =============================================================================
// BACKENDS
// =============================================================================

fn run_windowed(config: &Config) -> Result<()> {
    let mut window = WinitWindow::create(&config.window.title, config.window.extent())?;

    let backend = Arc::new(VulkanBackend::new(
        window.window(),
        &VulkanSettings {
            app_name: &config.window.title,
            validation: config.debug.validation_layers,
            extent: config.window.extent(),
            present_mode: config.present_mode(),
            min_images: config.graphics.frames_in_flight as u32,
            acquire_timeout: config.sync.fence_timeout(),
        },
    )?);

    run(backend, &mut window, config)?;
    Ok(())
}

fn run_headless(config: &Config) -> Result<()> {
    let device = Arc::new(HeadlessDevice::with_latency(
        config.window.extent(),
        config.graphics.frames_in_flight,
        Duration::from_millis(config.headless.latency_ms),
    )?);

    let mut events = match config.headless.frames {
        0 => ScriptedEvents::endless(),
        frames => ScriptedEvents::close_on(frames),
    };

    run(device.clone(), &mut events, config)?;

    let stats = device.stats();
    log::info!(
        "Headless device: {}/{} submissions executed, {} presents, {} skipped acquires, at most {} in flight, {} blocking waits, {} pipelines",
        stats.executed,
        stats.submissions,
        stats.presents,
        stats.skipped_acquires,
        stats.max_in_flight,
        stats.blocking_waits,
        stats.pipelines_created
    );
    if let Some(draw) = device.last_draw() {
        log::info!(
            "Last draw: submission {}, {} indices into backbuffer {} with pipeline {}, cleared to {:?}",
            draw.submission,
            draw.index_count,
            draw.target.0,
            draw.pipeline,
            device.backbuffer_clear(draw.target)
        );
    }
    Ok(())
}

// =============================================================================
// HOST
// =============================================================================

/// Build everything, render until closed, shut down cleanly
fn run<B: Backend, E: EventSource>(backend: Arc<B>, events: &mut E, config: &Config) -> Result<u64> {
    let fence_timeout = config.sync.fence_timeout();

    // Startup build retries with backoff, then gives up
    let builder = PipelineBuilder::new(
        backend.clone(),
        GlslcCompiler::new(&config.shaders.compiler),
        &config.shaders.path,
        FixedFunction::fullscreen(Vertex::layout()),
    )
    .stage(StageKind::Vertex, &config.shaders.vertex_entry)
    .stage(StageKind::Fragment, &config.shaders.fragment_entry);

    let reloader = PipelineReloader::start(
        builder,
        config.shaders.reload_interval(),
        &config.shaders.retry_policy(),
    )?;
    let pipelines = reloader.cell();
    let worker = ReloadWorker::spawn(reloader)?;

    let geometry = GeometryBuffers::upload_quad(&backend, fence_timeout)
        .context("Failed to upload geometry")?;
    let ring = FrameRing::new(&backend, config.graphics.frames_in_flight, fence_timeout)?;

    let mut frames = FrameLoop::new(
        backend.clone(),
        ring,
        geometry,
        pipelines,
        config.graphics.clear_color,
    );
    let mut ctx = EngineContext::new(&config.window.title, config.debug.show_fps);

    let result = frames.run(&mut ctx, events);
    worker.stop();
    let rendered = result?;

    backend.wait_idle()?;
    log::info!(
        "Rendered {} frames in {:.1}s, last pipeline generation {}",
        rendered,
        ctx.elapsed().as_secs_f32(),
        frames.generation()
    );
    Ok(rendered)
}
