// Pipeline state and hot reload
//
// A PipelineState is built once and never mutated after it is published.
// Reloading builds a complete replacement off the render thread and swaps
// the shared `Arc` in the PipelineCell. Frames keep their own `Arc` to the
// generation they recorded against until their fence retires, so a
// superseded pipeline object is released only when no frame in flight can
// still reference it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use crossbeam_channel::{select, Sender};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::backend::Backend;
use crate::compiler::{CompileError, ShaderCompiler, StageKind, StagePrograms};

// =============================================================================
// FIXED-FUNCTION CONFIGURATION
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    TriangleList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CullMode {
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeFormat {
    Float2,
    Float3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: AttributeFormat,
    pub offset: u32,
}

/// Interleaved single-binding vertex layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexLayout {
    pub stride: u32,
    pub attributes: Vec<VertexAttribute>,
}

/// Non-programmable part of a pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedFunction {
    pub topology: Topology,
    pub cull_mode: CullMode,
    pub blend: bool,
    pub depth_test: bool,
    pub vertex_layout: VertexLayout,
}

impl FixedFunction {
    /// Opaque, unculled triangles without depth, as a full-screen pass wants
    pub fn fullscreen(vertex_layout: VertexLayout) -> Self {
        Self {
            topology: Topology::TriangleList,
            cull_mode: CullMode::None,
            blend: false,
            depth_test: false,
            vertex_layout,
        }
    }
}

// =============================================================================
// PIPELINE STATE
// =============================================================================

/// One immutable generation of the rendering program
pub struct PipelineState<B: Backend> {
    generation: u64,
    programs: StagePrograms,
    fixed_function: FixedFunction,
    native: B::Pipeline,
}

impl<B: Backend> PipelineState<B> {
    /// Zero until the state is published
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Compiled program per stage, as handed to the backend
    pub fn programs(&self) -> &StagePrograms {
        &self.programs
    }

    pub fn fixed_function(&self) -> &FixedFunction {
        &self.fixed_function
    }

    pub fn native(&self) -> &B::Pipeline {
        &self.native
    }
}

/// Holds the current published PipelineState
pub struct PipelineCell<B: Backend> {
    current: RwLock<Arc<PipelineState<B>>>,
    fault: Mutex<Option<anyhow::Error>>,
}

impl<B: Backend> PipelineCell<B> {
    /// Publish `initial` as generation 1
    pub fn new(mut initial: PipelineState<B>) -> Self {
        initial.generation = 1;
        Self {
            current: RwLock::new(Arc::new(initial)),
            fault: Mutex::new(None),
        }
    }

    pub fn current(&self) -> Arc<PipelineState<B>> {
        self.current.read().clone()
    }

    pub fn generation(&self) -> u64 {
        self.current.read().generation
    }

    /// Replace the current state; returns the generation it was given
    pub fn publish(&self, mut state: PipelineState<B>) -> u64 {
        let mut current = self.current.write();
        state.generation = current.generation + 1;
        let generation = state.generation;
        *current = Arc::new(state);
        generation
    }

    /// The current state if it is newer than `generation`
    pub fn newer_than(&self, generation: u64) -> Option<Arc<PipelineState<B>>> {
        let current = self.current.read();
        (current.generation > generation).then(|| current.clone())
    }

    /// Record a fatal error hit while rebuilding off the render thread
    pub fn report_fault(&self, error: anyhow::Error) {
        let mut fault = self.fault.lock();
        if fault.is_none() {
            *fault = Some(error);
        }
    }

    pub fn take_fault(&self) -> Option<anyhow::Error> {
        self.fault.lock().take()
    }
}

// =============================================================================
// BUILDING
// =============================================================================

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("failed to create pipeline object: {0:#}")]
    Device(anyhow::Error),
}

/// Bounded retry for the startup build
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
}

pub struct PipelineBuilder<B: Backend, C: ShaderCompiler> {
    backend: Arc<B>,
    compiler: C,
    source: PathBuf,
    stages: Vec<(StageKind, String)>,
    fixed_function: FixedFunction,
}

impl<B: Backend, C: ShaderCompiler> PipelineBuilder<B, C> {
    pub fn new(
        backend: Arc<B>,
        compiler: C,
        source: impl Into<PathBuf>,
        fixed_function: FixedFunction,
    ) -> Self {
        Self {
            backend,
            compiler,
            source: source.into(),
            stages: Vec::new(),
            fixed_function,
        }
    }

    /// Require `stage`, compiled from `entry_point`
    pub fn stage(mut self, stage: StageKind, entry_point: impl Into<String>) -> Self {
        self.stages.push((stage, entry_point.into()));
        self
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Compile every stage and create the pipeline object
    pub fn build(&self) -> Result<PipelineState<B>, BuildError> {
        let mut programs = StagePrograms::new();
        for (stage, entry_point) in &self.stages {
            let program = self.compiler.compile(&self.source, entry_point, *stage)?;
            programs.insert(*stage, program);
        }

        let native = self
            .backend
            .create_pipeline(&programs, &self.fixed_function)
            .map_err(BuildError::Device)?;

        Ok(PipelineState {
            generation: 0,
            programs,
            fixed_function: self.fixed_function.clone(),
            native,
        })
    }

    /// Build, retrying compile failures with exponential backoff.
    ///
    /// Gives up with an error once `policy.attempts` builds have failed.
    /// Device failures are not retried.
    pub fn build_with_retry(&self, policy: &RetryPolicy) -> Result<PipelineState<B>> {
        anyhow::ensure!(policy.attempts > 0, "shader build needs at least one attempt");

        let mut delay = policy.backoff;
        let mut attempt = 1;
        loop {
            match self.build() {
                Ok(state) => return Ok(state),
                Err(BuildError::Compile(err)) if attempt < policy.attempts => {
                    log::warn!(
                        "Shader build attempt {}/{} failed, retrying in {:?}: {}",
                        attempt,
                        policy.attempts,
                        delay,
                        err
                    );
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(policy.max_backoff);
                    attempt += 1;
                }
                Err(BuildError::Compile(err)) => {
                    return Err(anyhow::Error::new(err).context(format!(
                        "Shader build failed after {} attempts",
                        policy.attempts
                    )));
                }
                Err(BuildError::Device(err)) => {
                    return Err(err.context("Failed to create pipeline object"));
                }
            }
        }
    }
}

// =============================================================================
// RELOADING
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadState {
    Idle,
    Checking,
    Building,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Polled again before the interval elapsed
    Throttled,
    Unchanged,
    Published(u64),
    /// Build failed; the active pipeline is untouched and the change will
    /// be retried on the next poll
    Failed,
}

/// Watches the shader source's timestamp and republishes on change
pub struct PipelineReloader<B: Backend, C: ShaderCompiler> {
    builder: PipelineBuilder<B, C>,
    cell: Arc<PipelineCell<B>>,
    interval: Duration,
    last_check: Option<Instant>,
    observed: Option<SystemTime>,
    state: ReloadState,
}

impl<B: Backend, C: ShaderCompiler> PipelineReloader<B, C> {
    /// Build the first generation (with retry) and start tracking the source
    pub fn start(
        builder: PipelineBuilder<B, C>,
        interval: Duration,
        retry: &RetryPolicy,
    ) -> Result<Self> {
        // Read the timestamp first so an edit during the build is not missed
        let observed = modified_time(builder.source()).ok();
        let initial = builder
            .build_with_retry(retry)
            .with_context(|| format!("Failed to build pipeline from {:?}", builder.source()))?;

        log::info!("Built initial pipeline from {:?}", builder.source());

        Ok(Self {
            builder,
            cell: Arc::new(PipelineCell::new(initial)),
            interval,
            last_check: None,
            observed,
            state: ReloadState::Idle,
        })
    }

    pub fn cell(&self) -> Arc<PipelineCell<B>> {
        self.cell.clone()
    }

    #[cfg(test)]
    pub fn state(&self) -> ReloadState {
        self.state
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn source(&self) -> &Path {
        self.builder.source()
    }

    /// Check the source at most once per interval and rebuild if it changed.
    ///
    /// Only device-level failures are returned as errors.
    pub fn poll(&mut self, now: Instant) -> Result<ReloadOutcome> {
        if let Some(last) = self.last_check {
            if now.saturating_duration_since(last) < self.interval {
                return Ok(ReloadOutcome::Throttled);
            }
        }
        self.last_check = Some(now);

        self.enter(ReloadState::Checking);
        let outcome = self.check();
        self.enter(ReloadState::Idle);
        outcome
    }

    fn enter(&mut self, state: ReloadState) {
        log::trace!("Reloader {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    fn check(&mut self) -> Result<ReloadOutcome> {
        let modified = match modified_time(self.builder.source()) {
            Ok(modified) => modified,
            Err(err) => {
                // Editors often replace the file; the next poll will see it
                log::warn!("Cannot stat {:?}: {}", self.builder.source(), err);
                return Ok(ReloadOutcome::Unchanged);
            }
        };

        if self.observed == Some(modified) {
            return Ok(ReloadOutcome::Unchanged);
        }

        log::info!("Reloading shaders from {:?}", self.builder.source());
        self.enter(ReloadState::Building);

        match self.builder.build() {
            Ok(state) => {
                let generation = self.cell.publish(state);
                self.observed = Some(modified);
                log::info!("Published pipeline generation {}", generation);
                Ok(ReloadOutcome::Published(generation))
            }
            Err(BuildError::Compile(err)) => {
                log::error!(
                    "Shader reload failed, keeping generation {}: {}",
                    self.cell.generation(),
                    err
                );
                Ok(ReloadOutcome::Failed)
            }
            Err(BuildError::Device(err)) => Err(err.context("Pipeline rebuild failed")),
        }
    }
}

fn modified_time(path: &Path) -> std::io::Result<SystemTime> {
    std::fs::metadata(path)?.modified()
}

// =============================================================================
// BACKGROUND WORKER
// =============================================================================

/// Runs a PipelineReloader on its own thread.
///
/// The worker polls once per interval and is woken early by file-system
/// events on the source's directory. A device failure stops the worker and
/// is handed to the render loop through the PipelineCell.
pub struct ReloadWorker {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
    _watcher: Option<RecommendedWatcher>,
}

impl ReloadWorker {
    pub fn spawn<B: Backend, C: ShaderCompiler>(mut reloader: PipelineReloader<B, C>) -> Result<Self> {
        let (stop, stopped) = crossbeam_channel::bounded::<()>(1);
        let (nudge, nudged) = crossbeam_channel::unbounded::<()>();

        let watcher = match watch_source(reloader.source(), nudge) {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                log::warn!("File watching unavailable, polling only: {}", err);
                None
            }
        };

        let interval = reloader.interval();
        let handle = std::thread::Builder::new()
            .name("pipeline-reload".to_string())
            .spawn(move || loop {
                select! {
                    recv(stopped) -> _ => break,
                    recv(nudged) -> _ => {}
                    default(interval) => {}
                }

                if let Err(err) = reloader.poll(Instant::now()) {
                    log::error!("Pipeline reload worker stopping: {:#}", err);
                    reloader.cell.report_fault(err);
                    break;
                }
            })
            .context("Failed to spawn pipeline reload thread")?;

        Ok(Self {
            stop,
            handle: Some(handle),
            _watcher: watcher,
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    #[cfg(test)]
    fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |handle| handle.is_finished())
    }

    fn shutdown(&mut self) {
        let _ = self.stop.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ReloadWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn watch_source(source: &Path, nudge: Sender<()>) -> notify::Result<RecommendedWatcher> {
    let file_name = source.file_name().map(|name| name.to_os_string());
    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        if let Ok(event) = event {
            let relevant = event.kind.is_modify() || event.kind.is_create();
            let ours = event
                .paths
                .iter()
                .any(|path| path.file_name().map(|n| n.to_os_string()) == file_name);
            if relevant && ours {
                let _ = nudge.send(());
            }
        }
    })?;

    let directory = match source.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    watcher.watch(directory, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessDevice;
    use crate::testing::{self, SourceCompiler, BROKEN_SHADER, GOOD_SHADER};
    use crate::upload::Vertex;

    const INTERVAL: Duration = Duration::from_secs(1);

    fn builder(
        device: Arc<HeadlessDevice>,
        compiler: SourceCompiler,
        source: &Path,
    ) -> PipelineBuilder<HeadlessDevice, SourceCompiler> {
        PipelineBuilder::new(device, compiler, source, FixedFunction::fullscreen(Vertex::layout()))
            .stage(StageKind::Vertex, "VS_main")
            .stage(StageKind::Fragment, "PS_main")
    }

    fn retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[test]
    fn publish_assigns_increasing_generations() {
        let dir = tempfile::tempdir().unwrap();
        let source = testing::write_shader(dir.path(), GOOD_SHADER);
        let builder = builder(testing::device(3), SourceCompiler::default(), &source);

        let cell = PipelineCell::new(builder.build().unwrap());
        assert_eq!(cell.generation(), 1);
        assert!(cell.newer_than(1).is_none());

        assert_eq!(cell.publish(builder.build().unwrap()), 2);
        assert_eq!(cell.publish(builder.build().unwrap()), 3);
        assert_eq!(cell.newer_than(1).map(|s| s.generation()), Some(3));
    }

    #[test]
    fn state_carries_every_stage() {
        let dir = tempfile::tempdir().unwrap();
        let source = testing::write_shader(dir.path(), GOOD_SHADER);
        let state = builder(testing::device(3), SourceCompiler::default(), &source)
            .build()
            .unwrap();

        let stages: Vec<_> = state.programs().keys().copied().collect();
        assert_eq!(stages, vec![StageKind::Vertex, StageKind::Fragment]);
        assert_eq!(state.programs()[&StageKind::Fragment].entry_point, "PS_main");
        assert_eq!(state.fixed_function().cull_mode, CullMode::None);
    }

    #[test]
    fn unchanged_source_does_not_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let source = testing::write_shader(dir.path(), GOOD_SHADER);
        let compiler = SourceCompiler::default();
        let mut reloader = PipelineReloader::start(
            builder(testing::device(3), compiler.clone(), &source),
            INTERVAL,
            &retry(),
        )
        .unwrap();
        let cell = reloader.cell();
        let before = cell.current();
        let builds = compiler.calls();

        let start = Instant::now();
        assert_eq!(reloader.poll(start).unwrap(), ReloadOutcome::Unchanged);
        assert_eq!(reloader.poll(start + INTERVAL).unwrap(), ReloadOutcome::Unchanged);

        assert!(Arc::ptr_eq(&before, &cell.current()));
        assert_eq!(cell.generation(), 1);
        assert_eq!(compiler.calls(), builds);
        assert_eq!(reloader.state(), ReloadState::Idle);
    }

    #[test]
    fn polls_are_rate_limited() {
        let dir = tempfile::tempdir().unwrap();
        let source = testing::write_shader(dir.path(), GOOD_SHADER);
        let mut reloader = PipelineReloader::start(
            builder(testing::device(3), SourceCompiler::default(), &source),
            INTERVAL,
            &retry(),
        )
        .unwrap();

        let start = Instant::now();
        assert_eq!(reloader.poll(start).unwrap(), ReloadOutcome::Unchanged);

        testing::edit_shader(&source, "float4 VS_main() { 1 } float4 PS_main() {}", 5);
        assert_eq!(
            reloader.poll(start + Duration::from_millis(500)).unwrap(),
            ReloadOutcome::Throttled
        );
        assert_eq!(reloader.poll(start + INTERVAL).unwrap(), ReloadOutcome::Published(2));
    }

    #[test]
    fn failed_build_keeps_active_state_and_retries() {
        let dir = tempfile::tempdir().unwrap();
        let source = testing::write_shader(dir.path(), GOOD_SHADER);
        let mut reloader = PipelineReloader::start(
            builder(testing::device(3), SourceCompiler::default(), &source),
            INTERVAL,
            &retry(),
        )
        .unwrap();
        let cell = reloader.cell();
        let before = cell.current();
        let start = Instant::now();

        testing::edit_shader(&source, BROKEN_SHADER, 5);
        assert_eq!(reloader.poll(start).unwrap(), ReloadOutcome::Failed);
        assert!(Arc::ptr_eq(&before, &cell.current()));

        // Same broken file: the timestamp was not taken, so it is retried
        assert_eq!(reloader.poll(start + INTERVAL).unwrap(), ReloadOutcome::Failed);
        assert!(Arc::ptr_eq(&before, &cell.current()));

        testing::edit_shader(&source, GOOD_SHADER, 5);
        assert_eq!(
            reloader.poll(start + INTERVAL * 2).unwrap(),
            ReloadOutcome::Published(2)
        );
        assert!(!Arc::ptr_eq(&before, &cell.current()));
        assert_eq!(cell.generation(), 2);
    }

    #[test]
    fn startup_gives_up_after_bounded_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let source = testing::write_shader(dir.path(), BROKEN_SHADER);
        let compiler = SourceCompiler::default();

        let result = PipelineReloader::start(
            builder(testing::device(3), compiler.clone(), &source),
            INTERVAL,
            &retry(),
        );

        assert!(result.is_err());
        // The vertex stage fails first on every attempt
        assert_eq!(compiler.calls(), 3);
    }

    #[test]
    fn worker_publishes_edits_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let source = testing::write_shader(dir.path(), GOOD_SHADER);
        let reloader = PipelineReloader::start(
            builder(testing::device(3), SourceCompiler::default(), &source),
            Duration::from_millis(10),
            &retry(),
        )
        .unwrap();
        let cell = reloader.cell();
        let worker = ReloadWorker::spawn(reloader).unwrap();

        testing::edit_shader(&source, "float4 VS_main() { 2 } float4 PS_main() {}", 5);

        let deadline = Instant::now() + Duration::from_secs(5);
        while cell.generation() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        worker.stop();

        assert_eq!(cell.generation(), 2);
        assert!(cell.take_fault().is_none());
    }

    #[test]
    fn worker_reports_device_failure_and_exits() {
        let dir = tempfile::tempdir().unwrap();
        let source = testing::write_shader(dir.path(), GOOD_SHADER);
        let device = testing::device(3);
        let reloader = PipelineReloader::start(
            builder(device.clone(), SourceCompiler::default(), &source),
            Duration::from_millis(10),
            &retry(),
        )
        .unwrap();
        let cell = reloader.cell();
        let worker = ReloadWorker::spawn(reloader).unwrap();

        testing::lose_device(&device);
        testing::edit_shader(&source, "float4 VS_main() { 4 } float4 PS_main() {}", 5);

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut fault = None;
        while fault.is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
            fault = cell.take_fault();
        }
        while !worker.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        let fault = fault.expect("worker never reported the device failure");
        assert!(format!("{:#}", fault).contains("Pipeline rebuild failed"));
        assert!(worker.is_finished());
        assert_eq!(cell.generation(), 1);
        worker.stop();
    }

    #[test]
    fn startup_does_not_retry_device_failures() {
        let dir = tempfile::tempdir().unwrap();
        let source = testing::write_shader(dir.path(), GOOD_SHADER);
        let device = testing::device(3);
        let compiler = SourceCompiler::default();
        testing::lose_device(&device);

        let err = builder(device, compiler.clone(), &source)
            .build_with_retry(&retry())
            .err()
            .unwrap();

        assert!(format!("{:#}", err).contains("Failed to create pipeline object"));
        // One attempt: both stages compiled once, then the device refused
        assert_eq!(compiler.calls(), 2);
    }
}
