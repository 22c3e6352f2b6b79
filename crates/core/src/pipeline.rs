//! Three-stage streaming pipeline: ingest → render → egress.
//!
//! Each stage runs on its own blocking thread and hands frames on through a
//! bounded [`frame_channel`]. The render stage owns frame scheduling
//! (interpolation timesteps, scene-cut holds, upscaling); an optional
//! [`PauseMonitor`] releases and reacquires engine resources while the stages
//! keep their place in the stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::channel::{frame_channel, FrameReceiver, FrameSender, IndexedFrame, DEFAULT_CHANNEL_CAPACITY};
use crate::engine::tensor::PaddedTensor;
use crate::engine::timestep::TimestepPlan;
use crate::engine::{Capability, EngineLease, InferenceEngine};
use crate::error::PipelineError;
use crate::pause::{PauseMonitor, PauseSignal, DEFAULT_PAUSE_POLL};
use crate::scene_cut::{NoCutOracle, SceneCutOracle};
use crate::types::{Frame, VideoProperties};

/// Destination for rendered frames, e.g. an encoder's stdin.
pub trait FrameSink: Send + 'static {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
}

pub type ProgressCallback = Box<dyn Fn(u64, Option<u64>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Running,
    Paused,
    /// Engines are being reloaded after a pause.
    Resuming,
    /// Input exhausted; remaining frames are flushing to the sink.
    Draining,
    Terminated,
}

/// Controller state shared between the stages and the pause monitor.
#[derive(Clone)]
pub struct StateCell {
    tx: Arc<watch::Sender<PipelineState>>,
}

impl StateCell {
    pub fn new(initial: PipelineState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> PipelineState {
        *self.tx.borrow()
    }

    pub fn set(&self, state: PipelineState) {
        let previous = self.tx.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Pipeline state changed");
        }
    }

    /// Move to `to` only if the current state is one of `from`.
    pub fn transition(&self, from: &[PipelineState], to: PipelineState) -> bool {
        self.tx.send_if_modified(|current| {
            if from.contains(current) {
                debug!(from = ?*current, to = ?to, "Pipeline state changed");
                *current = to;
                true
            } else {
                false
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.tx.subscribe()
    }
}

impl std::fmt::Debug for StateCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StateCell").field(&self.get()).finish()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub channel_capacity: usize,
    /// Interpolation factor; 1 disables interpolation.
    pub factor: f64,
    pub pause_poll: Duration,
    /// Sleep between checks while paused or waiting for an engine.
    pub render_idle: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            factor: 1.0,
            pause_poll: DEFAULT_PAUSE_POLL,
            render_idle: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub frames_read: u64,
    pub frames_written: u64,
    pub scene_cuts: u64,
    pub pauses: u64,
}

pub struct PipelineController {
    config: PipelineConfig,
    plan: TimestepPlan,
    interpolator: Option<Arc<InferenceEngine>>,
    upscaler: Option<Arc<InferenceEngine>>,
    oracle: Box<dyn SceneCutOracle>,
    pause: Option<Arc<dyn PauseSignal>>,
    progress: Option<ProgressCallback>,
    state: StateCell,
}

impl PipelineController {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let plan = TimestepPlan::new(config.factor)?;
        Ok(Self {
            config,
            plan,
            interpolator: None,
            upscaler: None,
            oracle: Box::new(NoCutOracle),
            pause: None,
            progress: None,
            state: StateCell::new(PipelineState::Running),
        })
    }

    pub fn with_interpolator(mut self, engine: Arc<InferenceEngine>) -> Result<Self> {
        require_capability(&engine, Capability::Interpolate)?;
        self.interpolator = Some(engine);
        Ok(self)
    }

    pub fn with_upscaler(mut self, engine: Arc<InferenceEngine>) -> Result<Self> {
        require_capability(&engine, Capability::Upscale)?;
        self.upscaler = Some(engine);
        Ok(self)
    }

    pub fn with_scene_oracle(mut self, oracle: Box<dyn SceneCutOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    pub fn with_pause_signal(mut self, signal: Arc<dyn PauseSignal>) -> Self {
        self.pause = Some(signal);
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn timestep_plan(&self) -> &TimestepPlan {
        &self.plan
    }

    pub fn state(&self) -> PipelineState {
        self.state.get()
    }

    pub fn state_handle(&self) -> StateCell {
        self.state.clone()
    }

    pub fn expected_output_frames(&self, input_frames: Option<u64>) -> Option<u64> {
        input_frames.map(|count| self.effective_plan_output(count))
    }

    fn effective_plan_output(&self, input_frames: u64) -> u64 {
        if self.interpolator.is_some() {
            self.plan.output_frame_count(input_frames)
        } else {
            input_frames
        }
    }

    fn validate(&self, props: &VideoProperties) -> Result<()> {
        if !self.plan.is_passthrough() && self.interpolator.is_none() {
            return Err(PipelineError::configuration(format!(
                "interpolation factor {} needs an interpolation engine",
                self.plan.factor()
            ))
            .into());
        }
        for engine in self.interpolator.iter().chain(self.upscaler.iter()) {
            let plan = engine.plan();
            if plan.width() != props.width || plan.height() != props.height {
                return Err(PipelineError::configuration(format!(
                    "engine '{}' was built for {}x{} but the stream is {}x{}",
                    engine.name(),
                    plan.width(),
                    plan.height(),
                    props.width,
                    props.height
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Stream every frame of `source` through the pipeline into `sink`.
    ///
    /// Returns the first stage error (with stage and frame context) after all
    /// stages have stopped.
    pub async fn run<S, E>(self, source: S, sink: E, props: &VideoProperties) -> Result<RunSummary>
    where
        S: Iterator<Item = Result<Frame>> + Send + 'static,
        E: FrameSink,
    {
        self.validate(props)?;

        let Self {
            config,
            plan,
            interpolator,
            upscaler,
            oracle,
            pause,
            progress,
            state,
        } = self;

        if interpolator.is_some() && plan.is_passthrough() {
            warn!("Interpolation factor is 1; interpolation engine will not be used");
        }
        let interpolator = interpolator.filter(|_| !plan.is_passthrough());
        let expected_output = props.frame_count.map(|count| {
            if interpolator.is_some() {
                plan.output_frame_count(count)
            } else {
                count
            }
        });

        info!(
            width = props.width,
            height = props.height,
            fps = props.frame_rate,
            factor = plan.factor(),
            interpolate = interpolator.is_some(),
            upscale = upscaler.is_some(),
            expected_output_frames = ?expected_output,
            channel_capacity = config.channel_capacity,
            "Starting pipeline"
        );

        state.set(PipelineState::Running);
        let (error_tx, mut error_rx) = mpsc::unbounded_channel::<anyhow::Error>();
        let (read_tx, read_rx) = frame_channel("read", config.channel_capacity);
        let (write_tx, write_rx) = frame_channel("write", config.channel_capacity);

        let reporter = ErrorReporter::new(error_tx, state.clone());

        let monitor_handle = pause.map(|signal| {
            let mut monitor = PauseMonitor::new(signal, state.clone(), config.pause_poll);
            for engine in interpolator.iter().chain(upscaler.iter()) {
                monitor = monitor.with_engine(engine.clone());
            }
            let reporter = reporter.clone();
            tokio::spawn(async move {
                match monitor.run().await {
                    Ok(pauses) => pauses,
                    Err(error) => {
                        reporter.report(error.context("pause monitor failed"));
                        0
                    }
                }
            })
        });

        let ingest = spawn_ingest_stage(source, read_tx, props.clone(), reporter.clone());
        let render = spawn_render_stage(
            RenderContext {
                plan,
                interpolator,
                upscaler,
                oracle,
                state: state.clone(),
                idle: config.render_idle,
            },
            read_rx,
            write_tx,
            reporter.clone(),
        );
        let egress = spawn_egress_stage(sink, write_rx, expected_output, progress, reporter);

        let mut first_error: Option<anyhow::Error> = None;
        let mut summary = RunSummary::default();

        match ingest.await {
            Ok(frames) => summary.frames_read = frames,
            Err(join_error) => {
                first_error.get_or_insert(anyhow!("streaming task panicked: {join_error}"));
            }
        }
        match render.await {
            Ok(cuts) => summary.scene_cuts = cuts,
            Err(join_error) => {
                first_error.get_or_insert(anyhow!("streaming task panicked: {join_error}"));
            }
        }
        match egress.await {
            Ok(frames) => summary.frames_written = frames,
            Err(join_error) => {
                first_error.get_or_insert(anyhow!("streaming task panicked: {join_error}"));
            }
        }

        state.set(PipelineState::Terminated);
        if let Some(handle) = monitor_handle {
            match handle.await {
                Ok(pauses) => summary.pauses = pauses,
                Err(join_error) => {
                    first_error.get_or_insert(anyhow!("pause monitor panicked: {join_error}"));
                }
            }
        }

        while let Some(error) = error_rx.recv().await {
            if first_error.is_none() {
                first_error = Some(error);
            } else {
                debug!(error = %format!("{error:#}"), "Suppressed follow-up pipeline error");
            }
        }

        if let Some(error) = first_error {
            match crate::error::classify(&error) {
                Some(typed) if !typed.is_fatal() => {
                    warn!(error = %format!("{error:#}"), "Pipeline stopped on a stream error")
                }
                _ => error!(error = %format!("{error:#}"), "Pipeline failed"),
            }
            return Err(error);
        }

        info!(
            frames_read = summary.frames_read,
            frames_written = summary.frames_written,
            scene_cuts = summary.scene_cuts,
            pauses = summary.pauses,
            "Pipeline finished"
        );
        Ok(summary)
    }
}

fn require_capability(engine: &InferenceEngine, capability: Capability) -> Result<()> {
    if engine.capability() != capability {
        return Err(PipelineError::configuration(format!(
            "engine '{}' cannot be used to {capability}",
            engine.name()
        ))
        .into());
    }
    Ok(())
}

/// Collects stage errors for the controller. A fatal error (anything but a
/// stream error) also aborts the run: the state goes to `Terminated` and
/// egress stops without finalizing the sink.
#[derive(Clone)]
struct ErrorReporter {
    tx: mpsc::UnboundedSender<anyhow::Error>,
    aborted: Arc<AtomicBool>,
    state: StateCell,
}

impl ErrorReporter {
    fn new(tx: mpsc::UnboundedSender<anyhow::Error>, state: StateCell) -> Self {
        Self {
            tx,
            aborted: Arc::new(AtomicBool::new(false)),
            state,
        }
    }

    /// Must run before the reporting stage closes its output, so downstream
    /// sees the abort no later than the sentinel.
    fn report(&self, error: anyhow::Error) {
        let fatal = crate::error::classify(&error).map_or(true, PipelineError::is_fatal);
        let _ = self.tx.send(error);
        if fatal {
            self.aborted.store(true, Ordering::SeqCst);
            self.state.set(PipelineState::Terminated);
        }
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

fn spawn_ingest_stage<S>(
    mut source: S,
    output: FrameSender,
    props: VideoProperties,
    reporter: ErrorReporter,
) -> tokio::task::JoinHandle<u64>
where
    S: Iterator<Item = Result<Frame>> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut read = 0_u64;
        let result = run_ingest_loop(&mut source, &output, &props, &mut read);
        if let Err(error) = result {
            reporter.report(error.context("ingest stage failed"));
        }
        // The sentinel goes out even after a failure so downstream drains.
        let _ = output.close();
        read
    })
}

fn spawn_render_stage(
    mut ctx: RenderContext,
    mut input: FrameReceiver,
    output: FrameSender,
    reporter: ErrorReporter,
) -> tokio::task::JoinHandle<u64> {
    tokio::task::spawn_blocking(move || {
        let result = run_render_loop(&mut ctx, &mut input, &output);
        let cuts = match result {
            Ok(stats) => stats.cuts,
            Err(error) => {
                reporter.report(error.context("render stage failed"));
                0
            }
        };
        let _ = output.close();
        cuts
    })
}

fn spawn_egress_stage<E>(
    mut sink: E,
    mut input: FrameReceiver,
    expected_output: Option<u64>,
    progress: Option<ProgressCallback>,
    reporter: ErrorReporter,
) -> tokio::task::JoinHandle<u64>
where
    E: FrameSink,
{
    tokio::task::spawn_blocking(move || {
        let mut written = 0_u64;
        let result = run_egress_loop(
            &mut sink,
            &mut input,
            expected_output,
            progress.as_ref(),
            &reporter,
            &mut written,
        );
        match result {
            Ok(EgressEnd::Drained) => {
                if let Err(error) = sink.finish().context("sink finish failed") {
                    reporter.report(error.context("egress stage failed while finalizing"));
                }
            }
            Ok(EgressEnd::Aborted) => {
                warn!(frames = written, "Run aborted; output left unfinalized");
            }
            Err(error) => reporter.report(error.context("egress stage failed")),
        }
        written
    })
}

fn run_ingest_loop<S>(
    source: &mut S,
    output: &FrameSender,
    props: &VideoProperties,
    read: &mut u64,
) -> Result<()>
where
    S: Iterator<Item = Result<Frame>>,
{
    let expected = props.dimensions();
    let mut total_read_ms = 0.0_f64;
    let mut total_send_ms = 0.0_f64;

    loop {
        let index = *read;
        let t_read = Instant::now();
        let Some(frame_result) = source.next() else {
            break;
        };
        let frame = frame_result.with_context(|| format!("failed to read frame {index}"))?;
        total_read_ms += t_read.elapsed().as_secs_f64() * 1000.0;

        if frame.dimensions() != expected {
            return Err(PipelineError::UnsupportedStreamChange {
                expected: expected.to_string(),
                actual: frame.dimensions().to_string(),
            })
            .with_context(|| format!("frame {index} changed shape"));
        }

        let t_send = Instant::now();
        if output.put(IndexedFrame::new(index, frame)).is_err() {
            debug!(frame = index, "Render stage closed; ingest stopping");
            break;
        }
        total_send_ms += t_send.elapsed().as_secs_f64() * 1000.0;

        *read += 1;
    }

    if *read > 0 {
        info!(
            frames = *read,
            avg_read_ms = format!("{:.1}", total_read_ms / *read as f64),
            avg_send_wait_ms = format!("{:.1}", total_send_ms / *read as f64),
            total_read_ms = format!("{:.0}", total_read_ms),
            total_send_wait_ms = format!("{:.0}", total_send_ms),
            "Ingest stage summary"
        );
    }

    Ok(())
}

struct RenderContext {
    plan: TimestepPlan,
    interpolator: Option<Arc<InferenceEngine>>,
    upscaler: Option<Arc<InferenceEngine>>,
    oracle: Box<dyn SceneCutOracle>,
    state: StateCell,
    idle: Duration,
}

#[derive(Debug, Default)]
struct RenderStats {
    sources: u64,
    emitted: u64,
    cuts: u64,
    total_recv_ms: f64,
    total_interpolate_ms: f64,
    total_upscale_ms: f64,
    total_send_ms: f64,
}

/// Downstream stopped consuming; the render loop should wind down quietly.
struct Stopped;

impl RenderContext {
    /// Block while paused. Errors once the controller has terminated.
    fn wait_while_paused(&self) -> Result<()> {
        loop {
            match self.state.get() {
                PipelineState::Paused | PipelineState::Resuming => std::thread::sleep(self.idle),
                PipelineState::Terminated => {
                    return Err(anyhow!("pipeline terminated while rendering"));
                }
                PipelineState::Running | PipelineState::Draining => return Ok(()),
            }
        }
    }

    /// Run `call` under a lease, waiting out pauses and unloaded engines.
    fn with_lease<T>(
        &self,
        engine: &InferenceEngine,
        mut call: impl FnMut(&mut EngineLease<'_>) -> Result<T>,
    ) -> Result<T> {
        loop {
            self.wait_while_paused()?;
            if let Some(mut lease) = engine.lease() {
                return call(&mut lease);
            }
            debug!(engine = %engine.name(), "Engine unloaded; waiting for reload");
            std::thread::sleep(self.idle);
        }
    }

    fn upscale(&self, frame: Frame, stats: &mut RenderStats) -> Result<Frame> {
        let Some(upscaler) = self.upscaler.as_deref() else {
            return Ok(frame);
        };
        let t_up = Instant::now();
        let input = upscaler.frame_to_tensor(&frame)?;
        let output = self.with_lease(upscaler, |lease| lease.upscale(&input))?;
        let frame = upscaler.tensor_to_frame(&output)?;
        stats.total_upscale_ms += t_up.elapsed().as_secs_f64() * 1000.0;
        Ok(frame)
    }

    fn emit(
        &self,
        output: &FrameSender,
        frame: Frame,
        stats: &mut RenderStats,
    ) -> std::result::Result<(), Stopped> {
        let t_send = Instant::now();
        output
            .put(IndexedFrame::new(stats.emitted, frame))
            .map_err(|_| Stopped)?;
        stats.total_send_ms += t_send.elapsed().as_secs_f64() * 1000.0;
        stats.emitted += 1;
        Ok(())
    }
}

fn run_render_loop(
    ctx: &mut RenderContext,
    input: &mut FrameReceiver,
    output: &FrameSender,
) -> Result<RenderStats> {
    let mut stats = RenderStats::default();
    let timesteps = ctx.plan.timesteps();
    let mut previous: Option<IndexedFrame> = None;
    // Padded tensor of `previous`, reused as the next pair's first input.
    let mut previous_tensor: Option<PaddedTensor> = None;

    loop {
        ctx.wait_while_paused()?;

        let t_recv = Instant::now();
        let Some(current) = input.get()? else {
            ctx.state.transition(
                &[PipelineState::Running, PipelineState::Paused, PipelineState::Resuming],
                PipelineState::Draining,
            );
            break;
        };
        stats.total_recv_ms += t_recv.elapsed().as_secs_f64() * 1000.0;
        stats.sources += 1;

        let is_cut = ctx
            .oracle
            .detect(&current.frame)
            .with_context(|| format!("scene detection failed on frame {}", current.index))?;

        let Some(prev) = previous.take() else {
            previous = Some(current);
            continue;
        };

        let intermediates = match ctx.interpolator.as_deref() {
            Some(_) if is_cut => {
                stats.cuts += 1;
                debug!(frame = current.index, "Scene cut; holding previous frame");
                previous_tensor = None;
                None
            }
            Some(interpolator) => {
                let t_interp = Instant::now();
                let first = match previous_tensor.take() {
                    Some(tensor) => tensor,
                    None => interpolator.frame_to_tensor(&prev.frame)?,
                };
                let second = interpolator.frame_to_tensor(&current.frame)?;

                let mut frames = Vec::with_capacity(timesteps.len());
                for &t in &timesteps {
                    let tensor = ctx
                        .with_lease(interpolator, |lease| lease.interpolate(&first, &second, t))
                        .with_context(|| {
                            format!(
                                "interpolation failed between frames {} and {} at t={t:.3}",
                                prev.index, current.index
                            )
                        })?;
                    frames.push(interpolator.tensor_to_frame(&tensor)?);
                }
                stats.total_interpolate_ms += t_interp.elapsed().as_secs_f64() * 1000.0;
                previous_tensor = Some(second);
                Some(frames)
            }
            None => Some(Vec::new()),
        };

        let source_index = prev.index;
        let prev_out = ctx
            .upscale(prev.frame, &mut stats)
            .with_context(|| format!("upscale failed on frame {source_index}"))?;

        match intermediates {
            // Hold: every intermediate is the (already upscaled) earlier frame.
            None => {
                for _ in 0..timesteps.len() {
                    if ctx.emit(output, prev_out.clone(), &mut stats).is_err() {
                        return Ok(stats);
                    }
                }
                if ctx.emit(output, prev_out, &mut stats).is_err() {
                    return Ok(stats);
                }
            }
            Some(frames) => {
                if ctx.emit(output, prev_out, &mut stats).is_err() {
                    return Ok(stats);
                }
                for frame in frames {
                    let frame = ctx
                        .upscale(frame, &mut stats)
                        .with_context(|| format!("upscale failed after frame {source_index}"))?;
                    if ctx.emit(output, frame, &mut stats).is_err() {
                        return Ok(stats);
                    }
                }
            }
        }

        previous = Some(current);
    }

    if let Some(last) = previous {
        let index = last.index;
        let frame = ctx
            .upscale(last.frame, &mut stats)
            .with_context(|| format!("upscale failed on frame {index}"))?;
        let _ = ctx.emit(output, frame, &mut stats);
    }

    if stats.sources > 0 {
        info!(
            sources = stats.sources,
            output_frames = stats.emitted,
            scene_cuts = stats.cuts,
            avg_recv_wait_ms = format!("{:.1}", stats.total_recv_ms / stats.sources as f64),
            total_interpolate_ms = format!("{:.0}", stats.total_interpolate_ms),
            total_upscale_ms = format!("{:.0}", stats.total_upscale_ms),
            total_send_wait_ms = format!("{:.0}", stats.total_send_ms),
            "Render stage summary"
        );
    }

    Ok(stats)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EgressEnd {
    /// Sentinel reached with no fatal error; the sink may be finalized.
    Drained,
    Aborted,
}

fn run_egress_loop<E>(
    sink: &mut E,
    input: &mut FrameReceiver,
    expected_output: Option<u64>,
    progress: Option<&ProgressCallback>,
    reporter: &ErrorReporter,
    written: &mut u64,
) -> Result<EgressEnd>
where
    E: FrameSink,
{
    let mut total_recv_ms = 0.0_f64;
    let mut total_write_ms = 0.0_f64;

    loop {
        let t_recv = Instant::now();
        let Some(item) = input.get()? else {
            break;
        };
        total_recv_ms += t_recv.elapsed().as_secs_f64() * 1000.0;
        if reporter.is_aborted() {
            break;
        }

        let t_write = Instant::now();
        sink.write_frame(&item.frame)
            .with_context(|| format!("failed to write frame {}", item.index))?;
        total_write_ms += t_write.elapsed().as_secs_f64() * 1000.0;

        *written += 1;
        if let Some(callback) = progress {
            callback(*written, expected_output);
        }
    }

    if *written > 0 {
        info!(
            frames = *written,
            avg_recv_wait_ms = format!("{:.1}", total_recv_ms / *written as f64),
            avg_write_ms = format!("{:.1}", total_write_ms / *written as f64),
            total_write_ms = format!("{:.0}", total_write_ms),
            total_recv_wait_ms = format!("{:.0}", total_recv_ms),
            "Egress stage summary"
        );
    }

    if reporter.is_aborted() {
        Ok(EgressEnd::Aborted)
    } else {
        Ok(EgressEnd::Drained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use anyhow::bail;

    #[derive(Clone)]
    struct SharedSinkState {
        values: Arc<Mutex<Vec<u8>>>,
        written: Arc<AtomicUsize>,
        finished: Arc<AtomicUsize>,
    }

    impl SharedSinkState {
        fn new() -> Self {
            Self {
                values: Arc::new(Mutex::new(Vec::new())),
                written: Arc::new(AtomicUsize::new(0)),
                finished: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn values(&self) -> Vec<u8> {
            self.values.lock().expect("values mutex poisoned").clone()
        }
    }

    struct CollectingSink {
        state: SharedSinkState,
        delay: Duration,
        fail_on: Option<usize>,
    }

    impl CollectingSink {
        fn new(state: SharedSinkState) -> Self {
            Self {
                state,
                delay: Duration::ZERO,
                fail_on: None,
            }
        }
    }

    impl FrameSink for CollectingSink {
        fn write_frame(&mut self, frame: &Frame) -> Result<()> {
            if self.delay > Duration::ZERO {
                std::thread::sleep(self.delay);
            }
            let count = self.state.written.load(Ordering::SeqCst);
            if self.fail_on == Some(count) {
                bail!("injected sink failure at frame {count}");
            }
            self.state
                .values
                .lock()
                .expect("values mutex poisoned")
                .push(frame.data()[0]);
            self.state.written.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            self.state.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn sample_frame(value: u8) -> Frame {
        Frame::filled(2, 2, 3, value)
    }

    fn props() -> VideoProperties {
        VideoProperties::rgb24(2, 2, 24.0)
    }

    #[tokio::test]
    async fn test_passthrough_preserves_order_and_finishes_sink() {
        let controller = PipelineController::new(PipelineConfig::default()).expect("controller");
        let state = SharedSinkState::new();
        let frames = (0_u8..10).map(sample_frame).map(Ok);

        let summary = controller
            .run(frames, CollectingSink::new(state.clone()), &props())
            .await
            .expect("pipeline should complete");

        assert_eq!(state.values(), (0_u8..10).collect::<Vec<_>>());
        assert_eq!(state.finished.load(Ordering::SeqCst), 1);
        assert_eq!(summary.frames_read, 10);
        assert_eq!(summary.frames_written, 10);
    }

    #[tokio::test]
    async fn test_slow_sink_still_receives_everything() {
        let controller = PipelineController::new(PipelineConfig {
            channel_capacity: 1,
            ..PipelineConfig::default()
        })
        .expect("controller");
        let state = SharedSinkState::new();
        let mut sink = CollectingSink::new(state.clone());
        sink.delay = Duration::from_millis(3);

        let summary = controller
            .run((0_u8..25).map(sample_frame).map(Ok), sink, &props())
            .await
            .expect("pipeline should complete");
        assert_eq!(summary.frames_written, 25);
        assert_eq!(state.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_source_error_drains_and_reports_frame() {
        let controller = PipelineController::new(PipelineConfig::default()).expect("controller");
        let state = SharedSinkState::new();
        let frames = (0_u8..6).map(|i| -> Result<Frame> {
            if i == 4 {
                Err(PipelineError::stream_io("decoder", "broken pipe").into())
            } else {
                Ok(sample_frame(i))
            }
        });

        let error = controller
            .run(frames, CollectingSink::new(state.clone()), &props())
            .await
            .expect_err("source failure should surface");
        let message = format!("{error:#}");
        assert!(message.contains("ingest stage failed"), "{message}");
        assert!(message.contains("failed to read frame 4"), "{message}");
        assert!(matches!(
            crate::error::classify(&error),
            Some(PipelineError::StreamIo { .. })
        ));
        assert_eq!(state.values(), vec![0, 1, 2, 3]);
        assert_eq!(state.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sink_error_stops_upstream() {
        let controller = PipelineController::new(PipelineConfig::default()).expect("controller");
        let state = SharedSinkState::new();
        let mut sink = CollectingSink::new(state.clone());
        sink.fail_on = Some(3);

        let error = controller
            .run((0_u64..10_000).map(|i| Ok(sample_frame(i as u8))), sink, &props())
            .await
            .expect_err("sink failure should surface");
        assert!(format!("{error:#}").contains("egress stage failed"));
        assert_eq!(state.values().len(), 3);
        assert_eq!(state.finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fatal_source_error_leaves_sink_unfinished() {
        let controller = PipelineController::new(PipelineConfig::default()).expect("controller");
        let state = SharedSinkState::new();
        let frames = (0_u8..6).map(|i| -> Result<Frame> {
            if i == 3 {
                Err(PipelineError::ShapeMismatch {
                    expected: 12,
                    actual: 48,
                }
                .into())
            } else {
                Ok(sample_frame(i))
            }
        });

        let error = controller
            .run(frames, CollectingSink::new(state.clone()), &props())
            .await
            .expect_err("fatal source failure should surface");
        assert!(matches!(
            crate::error::classify(&error),
            Some(PipelineError::ShapeMismatch { .. })
        ));
        assert!(state.values().len() <= 3);
        assert_eq!(state.finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_factor_without_interpolator_is_configuration_error() {
        let controller = PipelineController::new(PipelineConfig {
            factor: 2.0,
            ..PipelineConfig::default()
        })
        .expect("controller");
        let error = controller
            .run(
                std::iter::empty(),
                CollectingSink::new(SharedSinkState::new()),
                &props(),
            )
            .await
            .expect_err("missing interpolator");
        assert!(matches!(
            crate::error::classify(&error),
            Some(PipelineError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_source_finishes_cleanly() {
        let controller = PipelineController::new(PipelineConfig::default()).expect("controller");
        let state = SharedSinkState::new();
        let summary = controller
            .run(std::iter::empty(), CollectingSink::new(state.clone()), &props())
            .await
            .expect("empty stream");
        assert_eq!(summary, RunSummary::default());
        assert_eq!(state.finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_state_transition_is_conditional() {
        let state = StateCell::new(PipelineState::Draining);
        assert!(!state.transition(&[PipelineState::Running], PipelineState::Paused));
        assert_eq!(state.get(), PipelineState::Draining);
        assert!(state.transition(&[PipelineState::Draining], PipelineState::Terminated));
        assert_eq!(state.get(), PipelineState::Terminated);
    }
}
