// ============================================================================
// OBJECT REMOVAL ORCHESTRATION
// ============================================================================
//
// A removal session accumulates strokes without touching pixels, then commits
// them one at a time:
//
//   Clone / Heal   -> resolve one source offset -> region fill
//   ContentAware   -> small bounds: spot removal (time-boxed, hard failure)
//                  -> otherwise remote inpainting when allowed, falling back to
//                     PatchMatch -> region fill -> gradient blend
//
// Remote failures never surface as errors; they are logged and the local
// pipeline runs instead.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use image::RgbaImage;
use uuid::Uuid;

use crate::components::history::{ActivationSnapshot, StrokeHistory};
use crate::ops::ai::{self, HttpInpaintClient, InpaintClient, RemoteError, RemoteInpaint};
use crate::ops::gradient_blend::blend_gradient;
use crate::ops::inpaint::compute_nnf;
use crate::ops::region_fill::{FillReport, FillSource, fill_region, resolve_source_offset};
use crate::ops::spot_removal::{SpotRemovalError, spot_remove};
use crate::ops::stroke_mask::{BrushParams, FillMode, Mask, Point, Stroke, build_mask_clipped};
use crate::quota::{FileQuotaStore, SystemClock, UsageQuotaTracker};
use crate::settings::RemovalSettings;

// -- States and events -----------------------------------------------------------

/// Progress of one committed stroke. Display only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Preparing,
    Analyzing,
    Generating,
    Blending,
    Complete,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Preparing => "Preparing",
            Stage::Analyzing => "Analyzing",
            Stage::Generating => "Generating",
            Stage::Blending => "Blending",
            Stage::Complete => "Complete",
        }
    }

    fn to_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Stage::Preparing,
            1 => Stage::Analyzing,
            2 => Stage::Generating,
            3 => Stage::Blending,
            _ => Stage::Complete,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Drawing,
    Committing(Stage),
}

#[derive(Clone, Debug, PartialEq)]
pub enum StageEvent {
    Stage { session: Uuid, stroke: usize, stage: Stage },
    /// Transient status text (fallbacks, quota notices).
    Status { session: Uuid, message: String },
}

/// Publishes stage changes for one stroke of one session.
#[derive(Clone, Debug)]
pub struct StageReporter {
    session: Uuid,
    stroke: usize,
    current: Arc<AtomicU8>,
    events: Option<Sender<StageEvent>>,
}

impl StageReporter {
    pub fn new(session: Uuid, events: Option<Sender<StageEvent>>) -> Self {
        Self {
            session,
            stroke: 0,
            current: Arc::new(AtomicU8::new(Stage::Complete.to_u8())),
            events,
        }
    }

    /// Reporter that only tracks the current stage.
    pub fn silent() -> Self {
        Self::new(Uuid::nil(), None)
    }

    fn for_stroke(&self, stroke: usize) -> Self {
        Self {
            stroke,
            ..self.clone()
        }
    }

    pub fn stage(&self, stage: Stage) {
        self.current.store(stage.to_u8(), Ordering::Release);
        if let Some(tx) = &self.events {
            let _ = tx.send(StageEvent::Stage {
                session: self.session,
                stroke: self.stroke,
                stage,
            });
        }
    }

    pub fn status(&self, message: impl Into<String>) {
        let message = message.into();
        crate::log_info!("[{}] {}", self.session, message);
        if let Some(tx) = &self.events {
            let _ = tx.send(StageEvent::Status {
                session: self.session,
                message,
            });
        }
    }

    pub fn current(&self) -> Stage {
        Stage::from_u8(self.current.load(Ordering::Acquire))
    }
}

// -- Outcomes and errors ---------------------------------------------------------

/// Which route produced a stroke's pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemovalPath {
    /// Degenerate mask or unresolvable source; nothing changed.
    Skipped,
    FastPath,
    Remote,
    Local,
    /// Clone / Heal from a single source offset.
    Source,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StrokeOutcome {
    pub path: RemovalPath,
    pub report: FillReport,
}

impl StrokeOutcome {
    fn skipped() -> Self {
        Self {
            path: RemovalPath::Skipped,
            report: FillReport::default(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    pub strokes: Vec<StrokeOutcome>,
}

impl CommitOutcome {
    /// Some masked pixels had no usable source and were left as they were.
    pub fn is_partial(&self) -> bool {
        self.strokes.iter().any(|s| s.report.is_partial())
    }

    pub fn filled(&self) -> usize {
        self.strokes.iter().map(|s| s.report.filled).sum()
    }

    pub fn paths(&self) -> Vec<RemovalPath> {
        self.strokes.iter().map(|s| s.path).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovalError {
    NoImage,
    EmptyStrokeSet,
    CommitInFlight,
    FastPathTimeout { elapsed_ms: u64, budget_ms: u64 },
    WorkerPanicked,
}

impl fmt::Display for RemovalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemovalError::NoImage => write!(f, "No image loaded"),
            RemovalError::EmptyStrokeSet => write!(f, "Nothing to remove: no strokes drawn"),
            RemovalError::CommitInFlight => write!(f, "A removal is already in progress"),
            RemovalError::FastPathTimeout { elapsed_ms, budget_ms } => write!(
                f,
                "Spot removal exceeded its {} ms budget ({} ms elapsed)",
                budget_ms, elapsed_ms
            ),
            RemovalError::WorkerPanicked => write!(f, "Removal worker crashed; image restored"),
        }
    }
}

impl std::error::Error for RemovalError {}

impl From<SpotRemovalError> for RemovalError {
    fn from(e: SpotRemovalError) -> Self {
        match e {
            SpotRemovalError::Timeout { elapsed_ms, budget_ms } => {
                RemovalError::FastPathTimeout { elapsed_ms, budget_ms }
            }
        }
    }
}

// ============================================================================
// PIPELINE - per-stroke routing
// ============================================================================

pub struct RemovalPipeline {
    settings: RemovalSettings,
    quota: UsageQuotaTracker,
    client: Option<Arc<dyn InpaintClient>>,
    /// Set after a "not configured" reply; remote stays off for this pipeline.
    remote_unavailable: bool,
}

impl fmt::Debug for RemovalPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemovalPipeline")
            .field("settings", &self.settings)
            .field("quota", &self.quota)
            .field("has_client", &self.client.is_some())
            .field("remote_unavailable", &self.remote_unavailable)
            .finish()
    }
}

impl RemovalPipeline {
    pub fn new(settings: RemovalSettings, quota: UsageQuotaTracker) -> Self {
        Self {
            settings,
            quota,
            client: None,
            remote_unavailable: false,
        }
    }

    /// Pipeline with the persisted quota file and the HTTP client when the
    /// settings name a usable endpoint.
    pub fn from_settings(settings: RemovalSettings) -> Self {
        let quota = UsageQuotaTracker::new(
            settings.remote.daily_limit,
            Box::new(FileQuotaStore::default_location()),
            Box::new(SystemClock),
        );
        Self::new(settings, quota).with_default_client()
    }

    /// Attach an [`HttpInpaintClient`] for the configured endpoint, if any.
    pub fn with_default_client(mut self) -> Self {
        let remote = &self.settings.remote;
        if !remote.is_usable() {
            return self;
        }
        match HttpInpaintClient::new(remote.endpoint.clone(), remote.tier.timeout()) {
            Ok(client) => {
                crate::log_info!("Remote inpainting via {} ({})", client.endpoint(), remote.tier.as_str());
                self.client = Some(Arc::new(client));
            }
            Err(e) => {
                crate::log_warn!("Remote inpainting disabled: {}", e);
            }
        }
        self
    }

    pub fn with_client(mut self, client: Arc<dyn InpaintClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn settings(&self) -> &RemovalSettings {
        &self.settings
    }

    pub fn quota_mut(&mut self) -> &mut UsageQuotaTracker {
        &mut self.quota
    }

    fn remote_allowed(&mut self) -> bool {
        self.settings.remote.enabled
            && self.client.is_some()
            && !self.remote_unavailable
            && self.quota.can_call_remote()
    }

    /// Apply one stroke to `img`.
    pub fn run_stroke(
        &mut self,
        img: &mut RgbaImage,
        stroke: &Stroke,
        allow_fast_path: bool,
        reporter: &StageReporter,
    ) -> Result<StrokeOutcome, RemovalError> {
        reporter.stage(Stage::Preparing);
        let (w, h) = img.dimensions();
        let mask = build_mask_clipped(stroke, &self.settings.mask, w, h);
        if mask.is_empty() {
            crate::log_info!("Stroke produced an empty mask; nothing to do");
            reporter.stage(Stage::Complete);
            return Ok(StrokeOutcome::skipped());
        }

        let outcome = match stroke.mode {
            FillMode::Clone | FillMode::Heal => self.run_source_fill(img, &mask, stroke, reporter),
            FillMode::ContentAware => {
                let small = mask.bounds().area() < self.settings.small_area_threshold;
                if small && allow_fast_path {
                    self.run_fast_path(img, &mask, stroke, reporter)?
                } else {
                    reporter.stage(Stage::Analyzing);
                    match self.try_remote(img, &mask, stroke, reporter) {
                        Some(outcome) => outcome,
                        None => self.run_local(img, &mask, stroke, reporter),
                    }
                }
            }
        };

        if outcome.report.is_partial() {
            reporter.status(format!(
                "Partial fill: {} pixel(s) had no usable source",
                outcome.report.skipped
            ));
        }
        reporter.stage(Stage::Complete);
        Ok(outcome)
    }

    fn run_source_fill(
        &self,
        img: &mut RgbaImage,
        mask: &Mask,
        stroke: &Stroke,
        reporter: &StageReporter,
    ) -> StrokeOutcome {
        reporter.stage(Stage::Analyzing);
        let Some((dx, dy)) = resolve_source_offset(img, mask, stroke.source, &self.settings.fill) else {
            reporter.status("No usable source region found");
            return StrokeOutcome::skipped();
        };
        reporter.stage(Stage::Generating);
        let report = fill_region(
            img,
            mask,
            stroke.mode,
            FillSource::Offset(dx, dy),
            stroke.opacity,
            &self.settings.fill,
        );
        StrokeOutcome {
            path: RemovalPath::Source,
            report,
        }
    }

    fn run_fast_path(
        &self,
        img: &mut RgbaImage,
        mask: &Mask,
        stroke: &Stroke,
        reporter: &StageReporter,
    ) -> Result<StrokeOutcome, RemovalError> {
        reporter.stage(Stage::Generating);
        let report = spot_remove(
            img,
            mask,
            self.settings.fast_path_radius,
            stroke.opacity,
            self.settings.fast_path_budget(),
        )
        .map_err(|e| {
            crate::log_warn!("Fast path failed: {}", e);
            RemovalError::from(e)
        })?;
        Ok(StrokeOutcome {
            path: RemovalPath::FastPath,
            report,
        })
    }

    /// Remote attempt; `None` means fall back to the local pipeline.
    fn try_remote(
        &mut self,
        img: &mut RgbaImage,
        mask: &Mask,
        stroke: &Stroke,
        reporter: &StageReporter,
    ) -> Option<StrokeOutcome> {
        if !self.remote_allowed() {
            if self.settings.remote.enabled && self.client.is_some() && !self.remote_unavailable {
                reporter.status("Daily AI removal limit reached; using local fill");
            }
            return None;
        }

        reporter.stage(Stage::Generating);
        match self.call_remote(img, mask) {
            Ok(result) => {
                self.quota.record_success(Some(result.remaining));
                reporter.stage(Stage::Blending);
                let report = ai::composite_result(img, &result.image, mask, stroke.opacity);
                crate::log_info!(
                    "Remote removal applied ({} px, {} call(s) left today)",
                    report.filled,
                    self.quota.remaining()
                );
                Some(StrokeOutcome {
                    path: RemovalPath::Remote,
                    report,
                })
            }
            Err(RemoteError::RateLimited(message)) => {
                self.quota.mark_exhausted();
                reporter.status(message);
                None
            }
            Err(RemoteError::NotConfigured) => {
                self.remote_unavailable = true;
                crate::log_warn!("Remote inpainting not configured; using local fill from now on");
                None
            }
            Err(e) => {
                crate::log_warn!("Remote inpainting failed, falling back: {}", e);
                reporter.status("AI removal unavailable; using local fill");
                None
            }
        }
    }

    /// Run the client on its own thread and give up after the tier's time box.
    /// A late reply is dropped with the receiver.
    fn call_remote(&self, img: &RgbaImage, mask: &Mask) -> Result<RemoteInpaint, RemoteError> {
        let client = self.client.clone().ok_or(RemoteError::NotConfigured)?;
        let image = img.clone();
        let raster = mask.to_raster(img.width(), img.height());
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(client.inpaint(&image, &raster));
        });

        let started = Instant::now();
        let result = match rx.recv_timeout(self.settings.remote.tier.timeout()) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(RemoteError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(RemoteError::Network("remote worker exited".into())),
        };
        crate::log_info!("Remote call finished in {} ms", started.elapsed().as_millis());
        result
    }

    fn run_local(&self, img: &mut RgbaImage, mask: &Mask, stroke: &Stroke, reporter: &StageReporter) -> StrokeOutcome {
        let nnf = compute_nnf(img, mask, self.settings.patch);
        reporter.stage(Stage::Generating);
        let report = fill_region(
            img,
            mask,
            FillMode::ContentAware,
            FillSource::Field(&nnf),
            stroke.opacity,
            &self.settings.fill,
        );
        if mask.area() >= self.settings.blend_min_area && self.settings.blend_iterations > 0 {
            reporter.stage(Stage::Blending);
            let sweeps = blend_gradient(img, mask, self.settings.blend_iterations);
            crate::log_info!("Gradient blend converged after {} sweep(s)", sweeps);
        }
        StrokeOutcome {
            path: RemovalPath::Local,
            report,
        }
    }
}

/// Result of running a batch of strokes. On failure, `failed_at` is the index
/// of the stroke that failed; it and everything after it were not applied.
struct CommitRun {
    outcome: CommitOutcome,
    failure: Option<(usize, RemovalError)>,
}

fn run_commit(
    pipeline: &Mutex<RemovalPipeline>,
    img: &mut RgbaImage,
    strokes: &[Stroke],
    allow_fast_path: bool,
    reporter: &StageReporter,
) -> CommitRun {
    let mut pipeline = pipeline.lock().unwrap_or_else(|e| e.into_inner());
    let mut outcome = CommitOutcome::default();
    for (i, stroke) in strokes.iter().enumerate() {
        match pipeline.run_stroke(img, stroke, allow_fast_path, &reporter.for_stroke(i)) {
            Ok(s) => outcome.strokes.push(s),
            Err(e) => {
                return CommitRun {
                    outcome,
                    failure: Some((i, e)),
                };
            }
        }
    }
    CommitRun { outcome, failure: None }
}

// ============================================================================
// SESSION - activation, strokes, commits
// ============================================================================

enum WorkerReply {
    Done {
        image: RgbaImage,
        strokes: Vec<Stroke>,
        run: CommitRun,
    },
    Panicked,
}

struct InFlight {
    rx: Receiver<WorkerReply>,
    /// Buffer and strokes as they were when the worker took them.
    backup: RgbaImage,
    strokes: Vec<Stroke>,
}

pub struct RemovalSession {
    id: Uuid,
    pipeline: Arc<Mutex<RemovalPipeline>>,
    buffer: Option<RgbaImage>,
    snapshot: Option<ActivationSnapshot>,
    history: StrokeHistory,
    reporter: StageReporter,
    events: Option<Sender<StageEvent>>,
    in_flight: Option<InFlight>,
}

impl RemovalSession {
    pub fn new(pipeline: RemovalPipeline) -> Self {
        Self {
            id: Uuid::nil(),
            pipeline: Arc::new(Mutex::new(pipeline)),
            buffer: None,
            snapshot: None,
            history: StrokeHistory::new(),
            reporter: StageReporter::silent(),
            events: None,
            in_flight: None,
        }
    }

    pub fn with_events(mut self, events: Sender<StageEvent>) -> Self {
        self.reporter = StageReporter::new(self.id, Some(events.clone()));
        self.events = Some(events);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Take over `image` as the working buffer and snapshot it for cancel.
    pub fn activate(&mut self, image: RgbaImage) -> Result<(), RemovalError> {
        if self.in_flight.is_some() {
            return Err(RemovalError::CommitInFlight);
        }
        self.id = Uuid::new_v4();
        self.reporter = StageReporter::new(self.id, self.events.clone());
        let (w, h) = image.dimensions();
        let snapshot = ActivationSnapshot::capture(&image);
        crate::log_info!(
            "[{}] Removal session activated ({}x{}, snapshot {} KiB)",
            self.id,
            w,
            h,
            snapshot.memory_size() / 1024
        );
        self.snapshot = Some(snapshot);
        self.buffer = Some(image);
        self.history.clear();
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn state(&self) -> SessionState {
        if self.is_committing() {
            SessionState::Committing(self.reporter.current())
        } else if !self.history.is_empty() {
            SessionState::Drawing
        } else {
            SessionState::Idle
        }
    }

    /// Last stage reported by the most recent commit.
    pub fn stage(&self) -> Stage {
        self.reporter.current()
    }

    /// The working buffer; `None` before activation or while a background
    /// commit holds it.
    pub fn buffer(&self) -> Option<&RgbaImage> {
        self.buffer.as_ref()
    }

    pub fn take_buffer(&mut self) -> Option<RgbaImage> {
        self.buffer.take()
    }

    pub fn is_committing(&self) -> bool {
        self.in_flight.is_some()
    }

    // -- Drawing (never mutates pixels) --

    pub fn begin_stroke(&mut self, brush: BrushParams, start: Point, source: Option<Point>) -> Result<(), RemovalError> {
        if !self.is_active() {
            return Err(RemovalError::NoImage);
        }
        self.history.begin(brush, start, source);
        Ok(())
    }

    pub fn extend_stroke(&mut self, p: Point) -> bool {
        self.history.extend(p)
    }

    pub fn end_stroke(&mut self) -> bool {
        self.history.finish()
    }

    /// Queue a complete stroke.
    pub fn add_stroke(&mut self, stroke: Stroke) -> Result<(), RemovalError> {
        if !self.is_active() {
            return Err(RemovalError::NoImage);
        }
        self.history.push(stroke);
        Ok(())
    }

    pub fn undo_stroke(&mut self) -> Option<Stroke> {
        self.history.undo()
    }

    pub fn pending_strokes(&self) -> &[Stroke] {
        self.history.strokes()
    }

    /// Drop uncommitted strokes and restore the activation-time pixels. An
    /// in-flight commit is waited for and its result discarded.
    pub fn cancel(&mut self) {
        if self.in_flight.is_some() {
            let _ = self.wait_commit();
        }
        self.history.clear();
        if let Some(snapshot) = &self.snapshot {
            self.buffer = Some(snapshot.restore());
            crate::log_info!("[{}] Removal cancelled; image restored", self.id);
        }
    }

    // -- Commit --

    fn take_commit_input(&mut self) -> Result<(RgbaImage, Vec<Stroke>), RemovalError> {
        if self.in_flight.is_some() {
            return Err(RemovalError::CommitInFlight);
        }
        if self.buffer.is_none() {
            return Err(RemovalError::NoImage);
        }
        self.history.finish();
        let strokes = self.history.drain();
        if strokes.is_empty() {
            return Err(RemovalError::EmptyStrokeSet);
        }
        let image = self.buffer.take().ok_or(RemovalError::NoImage)?;
        Ok((image, strokes))
    }

    /// Fold a finished run back into the session.
    fn finish_commit(&mut self, image: RgbaImage, strokes: Vec<Stroke>, run: CommitRun) -> Result<CommitOutcome, RemovalError> {
        self.buffer = Some(image);
        match run.failure {
            None => {
                crate::log_info!(
                    "[{}] Commit complete: {} stroke(s), {} px filled{}",
                    self.id,
                    run.outcome.strokes.len(),
                    run.outcome.filled(),
                    if run.outcome.is_partial() { " (partial)" } else { "" }
                );
                Ok(run.outcome)
            }
            Some((index, err)) => {
                crate::log_err!("[{}] Commit failed at stroke {}: {}", self.id, index, err);
                self.history.requeue_front(strokes.into_iter().skip(index).collect());
                Err(err)
            }
        }
    }

    fn commit_with(&mut self, allow_fast_path: bool) -> Result<CommitOutcome, RemovalError> {
        let (mut image, strokes) = self.take_commit_input()?;
        let run = run_commit(&self.pipeline, &mut image, &strokes, allow_fast_path, &self.reporter);
        self.finish_commit(image, strokes, run)
    }

    /// Apply every queued stroke on the calling thread.
    ///
    /// A fast-path timeout stops the commit: earlier strokes stay applied, the
    /// failed stroke and the rest go back in the queue.
    pub fn commit(&mut self) -> Result<CommitOutcome, RemovalError> {
        self.commit_with(true)
    }

    /// Commit with the fast path disabled, for retrying after a timeout.
    pub fn commit_general(&mut self) -> Result<CommitOutcome, RemovalError> {
        self.commit_with(false)
    }

    /// Hand the buffer and queued strokes to a worker. The buffer is
    /// unavailable until [`poll_commit`](Self::poll_commit) or
    /// [`wait_commit`](Self::wait_commit) returns a result.
    pub fn commit_in_background(&mut self) -> Result<(), RemovalError> {
        let (image, strokes) = self.take_commit_input()?;
        let backup = image.clone();
        let pipeline = Arc::clone(&self.pipeline);
        let reporter = self.reporter.clone();
        let worker_strokes = strokes.clone();
        let (tx, rx) = mpsc::channel();

        crate::log_info!("[{}] Background commit of {} stroke(s)", self.id, strokes.len());
        rayon::spawn(move || {
            let mut image = image;
            let run = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                run_commit(&pipeline, &mut image, &worker_strokes, true, &reporter)
            }));
            let reply = match run {
                Ok(run) => WorkerReply::Done {
                    image,
                    strokes: worker_strokes,
                    run,
                },
                Err(_) => WorkerReply::Panicked,
            };
            let _ = tx.send(reply);
        });

        self.in_flight = Some(InFlight { rx, backup, strokes });
        Ok(())
    }

    fn settle(&mut self, reply: Option<WorkerReply>) -> Result<CommitOutcome, RemovalError> {
        let Some(in_flight) = self.in_flight.take() else {
            return Err(RemovalError::EmptyStrokeSet);
        };
        match reply {
            Some(WorkerReply::Done { image, strokes, run }) => self.finish_commit(image, strokes, run),
            Some(WorkerReply::Panicked) | None => {
                crate::log_err!("[{}] Removal worker panicked; restoring pre-commit image", self.id);
                self.buffer = Some(in_flight.backup);
                self.history.requeue_front(in_flight.strokes);
                self.reporter.stage(Stage::Complete);
                Err(RemovalError::WorkerPanicked)
            }
        }
    }

    /// Non-blocking check on a background commit. `None` while it runs or
    /// when nothing is in flight.
    pub fn poll_commit(&mut self) -> Option<Result<CommitOutcome, RemovalError>> {
        let reply = match self.in_flight.as_ref()?.rx.try_recv() {
            Ok(reply) => Some(reply),
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Disconnected) => None,
        };
        Some(self.settle(reply))
    }

    /// Block until the background commit finishes.
    pub fn wait_commit(&mut self) -> Option<Result<CommitOutcome, RemovalError>> {
        let reply = self.in_flight.as_ref()?.rx.recv().ok();
        Some(self.settle(reply))
    }
}

impl fmt::Debug for RemovalSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemovalSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("pending", &self.history.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::{ManualClock, MemoryQuotaStore};
    use image::{GrayImage, Rgba};
    use std::sync::atomic::AtomicUsize;

    struct CountingClient {
        calls: AtomicUsize,
        reply: Result<RgbaImage, RemoteError>,
        remaining: u32,
    }

    impl CountingClient {
        fn ok(color: Rgba<u8>, w: u32, h: u32, remaining: u32) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                reply: Ok(RgbaImage::from_pixel(w, h, color)),
                remaining,
            })
        }

        fn failing(err: RemoteError) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                reply: Err(err),
                remaining: 0,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl InpaintClient for CountingClient {
        fn inpaint(&self, _image: &RgbaImage, _mask: &GrayImage) -> Result<RemoteInpaint, RemoteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone().map(|image| RemoteInpaint {
                image,
                remaining: self.remaining,
            })
        }
    }

    fn quota(limit: u32) -> UsageQuotaTracker {
        UsageQuotaTracker::new(
            limit,
            Box::new(MemoryQuotaStore::default()),
            Box::new(ManualClock::new("2026-10-18")),
        )
    }

    fn networked(limit: u32) -> RemovalSettings {
        let mut s = RemovalSettings::default();
        s.remote.enabled = true;
        s.remote.endpoint = "http://localhost:9/inpaint".into();
        s.remote.daily_limit = limit;
        s
    }

    fn big_stroke() -> Stroke {
        let brush = BrushParams {
            radius: 12.0,
            feather: 0.2,
            opacity: 1.0,
            mode: FillMode::ContentAware,
        };
        let mut s = Stroke::new(brush, Point::new(20.0, 30.0));
        s.push(Point::new(40.0, 30.0));
        s
    }

    fn gradient(w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_fn(w, h, |x, y| Rgba([(x * 3) as u8, (y * 3) as u8, 90, 255]))
    }

    #[test]
    fn commit_without_strokes_or_image_is_rejected() {
        let mut session = RemovalSession::new(RemovalPipeline::new(RemovalSettings::default(), quota(5)));
        assert_eq!(session.commit(), Err(RemovalError::NoImage));
        assert_eq!(
            session.begin_stroke(BrushParams::default(), Point::new(1.0, 1.0), None),
            Err(RemovalError::NoImage)
        );
        session.activate(gradient(20, 20)).unwrap();
        assert_eq!(session.commit(), Err(RemovalError::EmptyStrokeSet));
        assert!(session.buffer().is_some());
    }

    #[test]
    fn drawing_and_undo_never_touch_pixels() {
        let img = gradient(40, 40);
        let mut session = RemovalSession::new(RemovalPipeline::new(RemovalSettings::default(), quota(5)));
        session.activate(img.clone()).unwrap();
        session
            .begin_stroke(BrushParams::default(), Point::new(5.0, 5.0), None)
            .unwrap();
        session.extend_stroke(Point::new(9.0, 5.0));
        session.end_stroke();
        assert_eq!(session.state(), SessionState::Drawing);
        assert_eq!(session.buffer(), Some(&img));

        assert!(session.undo_stroke().is_some());
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.commit(), Err(RemovalError::EmptyStrokeSet));
    }

    #[test]
    fn remote_success_is_composited_and_counted() {
        let client = CountingClient::ok(Rgba([10, 200, 10, 255]), 64, 64, 3);
        let pipeline = RemovalPipeline::new(networked(5), quota(5)).with_client(client.clone());
        let mut session = RemovalSession::new(pipeline);
        session.activate(gradient(64, 64)).unwrap();
        session.add_stroke(big_stroke()).unwrap();

        let outcome = session.commit().unwrap();
        assert_eq!(outcome.paths(), vec![RemovalPath::Remote]);
        assert_eq!(client.calls(), 1);
        assert_eq!(session.buffer().unwrap().get_pixel(30, 30), &Rgba([10, 200, 10, 255]));
        assert_eq!(session.buffer().unwrap().get_pixel(0, 0), &Rgba([0, 0, 90, 255]));
        // Server says 3 remain: local count follows.
        assert_eq!(session.pipeline.lock().unwrap().quota_mut().remaining(), 3);
    }

    #[test]
    fn rate_limited_reply_falls_back_and_stops_asking() {
        let client = CountingClient::failing(RemoteError::RateLimited("Come back tomorrow".into()));
        let pipeline = RemovalPipeline::new(networked(5), quota(5)).with_client(client.clone());
        let (tx, rx) = mpsc::channel();
        let mut session = RemovalSession::new(pipeline).with_events(tx);
        session.activate(gradient(64, 64)).unwrap();

        session.add_stroke(big_stroke()).unwrap();
        assert_eq!(session.commit().unwrap().paths(), vec![RemovalPath::Local]);
        session.add_stroke(big_stroke()).unwrap();
        assert_eq!(session.commit().unwrap().paths(), vec![RemovalPath::Local]);

        assert_eq!(client.calls(), 1);
        let statuses: Vec<String> = rx
            .try_iter()
            .filter_map(|e| match e {
                StageEvent::Status { message, .. } => Some(message),
                _ => None,
            })
            .collect();
        assert!(statuses.iter().any(|m| m == "Come back tomorrow"));
    }

    #[test]
    fn network_failure_falls_back_to_local() {
        let client = CountingClient::failing(RemoteError::Network("connection refused".into()));
        let pipeline = RemovalPipeline::new(networked(5), quota(5)).with_client(client.clone());
        let mut session = RemovalSession::new(pipeline);
        session.activate(gradient(64, 64)).unwrap();
        session.add_stroke(big_stroke()).unwrap();

        assert_eq!(session.commit().unwrap().paths(), vec![RemovalPath::Local]);
        assert_eq!(client.calls(), 1);
        assert_eq!(session.stage(), Stage::Complete);
    }

    #[test]
    fn not_configured_disables_remote_for_the_pipeline() {
        let client = CountingClient::failing(RemoteError::NotConfigured);
        let pipeline = RemovalPipeline::new(networked(5), quota(5)).with_client(client.clone());
        let mut session = RemovalSession::new(pipeline);
        session.activate(gradient(64, 64)).unwrap();
        session.add_stroke(big_stroke()).unwrap();
        session.add_stroke(big_stroke()).unwrap();

        assert_eq!(session.commit().unwrap().paths(), vec![RemovalPath::Local, RemovalPath::Local]);
        assert_eq!(client.calls(), 1);
    }

    #[test]
    fn small_masks_take_the_fast_path() {
        let mut session = RemovalSession::new(RemovalPipeline::new(RemovalSettings::default(), quota(0)));
        let mut img = RgbaImage::from_pixel(30, 30, Rgba([40, 40, 40, 255]));
        img.put_pixel(15, 15, Rgba([255, 255, 255, 255]));
        session.activate(img).unwrap();
        let brush = BrushParams {
            radius: 3.0,
            feather: 0.0,
            opacity: 1.0,
            mode: FillMode::ContentAware,
        };
        session.begin_stroke(brush, Point::new(15.0, 15.0), None).unwrap();
        session.end_stroke();

        let outcome = session.commit().unwrap();
        assert_eq!(outcome.paths(), vec![RemovalPath::FastPath]);
        assert_eq!(session.buffer().unwrap().get_pixel(15, 15), &Rgba([40, 40, 40, 255]));
    }

    #[test]
    fn fast_path_timeout_requeues_the_stroke() {
        let mut settings = RemovalSettings::default();
        settings.fast_path_budget_ms = 0;
        let mut session = RemovalSession::new(RemovalPipeline::new(settings, quota(0)));
        let img = gradient(30, 30);
        session.activate(img.clone()).unwrap();
        let brush = BrushParams {
            radius: 3.0,
            feather: 0.0,
            opacity: 1.0,
            mode: FillMode::ContentAware,
        };
        session.add_stroke(Stroke::new(brush, Point::new(10.0, 10.0))).unwrap();

        assert!(matches!(session.commit(), Err(RemovalError::FastPathTimeout { budget_ms: 0, .. })));
        assert_eq!(session.buffer(), Some(&img));
        assert_eq!(session.pending_strokes().len(), 1);

        let outcome = session.commit_general().unwrap();
        assert_eq!(outcome.paths(), vec![RemovalPath::Local]);
    }

    #[test]
    fn clone_strokes_copy_from_the_source_point() {
        let mut session = RemovalSession::new(RemovalPipeline::new(RemovalSettings::default(), quota(0)));
        let img = gradient(60, 60);
        session.activate(img.clone()).unwrap();
        let brush = BrushParams {
            radius: 4.0,
            feather: 0.0,
            opacity: 1.0,
            mode: FillMode::Clone,
        };
        session
            .begin_stroke(brush, Point::new(20.0, 20.0), Some(Point::new(40.0, 30.0)))
            .unwrap();
        session.end_stroke();

        let outcome = session.commit().unwrap();
        assert_eq!(outcome.paths(), vec![RemovalPath::Source]);
        assert_eq!(session.buffer().unwrap().get_pixel(20, 20), img.get_pixel(40, 30));
    }

    #[test]
    fn cancel_restores_the_activation_snapshot() {
        // Red block on grey, fully inside the stroke.
        let img = RgbaImage::from_fn(64, 64, |x, y| {
            if (26..34).contains(&x) && (26..34).contains(&y) {
                Rgba([220, 20, 20, 255])
            } else {
                Rgba([100, 100, 100, 255])
            }
        });
        let mut session = RemovalSession::new(RemovalPipeline::new(RemovalSettings::default(), quota(0)));
        session.activate(img.clone()).unwrap();
        session.add_stroke(big_stroke()).unwrap();
        session.commit().unwrap();
        assert_ne!(session.buffer().unwrap().get_pixel(30, 30), &Rgba([220, 20, 20, 255]));

        session.add_stroke(big_stroke()).unwrap();
        session.cancel();
        assert_eq!(session.buffer(), Some(&img));
        assert!(session.pending_strokes().is_empty());
    }

    #[test]
    fn background_commit_holds_the_buffer_until_settled() {
        let (tx, rx) = mpsc::channel();
        let mut session =
            RemovalSession::new(RemovalPipeline::new(RemovalSettings::default(), quota(0))).with_events(tx);
        session.activate(gradient(64, 64)).unwrap();
        session.add_stroke(big_stroke()).unwrap();
        session.commit_in_background().unwrap();

        assert!(session.buffer().is_none());
        assert!(matches!(session.state(), SessionState::Committing(_)));
        assert_eq!(session.commit(), Err(RemovalError::CommitInFlight));
        assert_eq!(session.activate(gradient(8, 8)), Err(RemovalError::CommitInFlight));
        // Queuing while a commit runs is allowed.
        session.add_stroke(big_stroke()).unwrap();

        let outcome = session.wait_commit().unwrap().unwrap();
        assert_eq!(outcome.paths(), vec![RemovalPath::Local]);
        assert!(session.buffer().is_some());
        assert_eq!(session.pending_strokes().len(), 1);
        assert_eq!(session.stage(), Stage::Complete);

        let stages: Vec<Stage> = rx
            .try_iter()
            .filter_map(|e| match e {
                StageEvent::Stage { stage, .. } => Some(stage),
                _ => None,
            })
            .collect();
        assert_eq!(stages.first(), Some(&Stage::Preparing));
        assert_eq!(stages.last(), Some(&Stage::Complete));
        assert!(stages.contains(&Stage::Blending));
    }

    #[test]
    fn client_panic_reads_as_a_failed_call() {
        struct PanickingClient;
        impl InpaintClient for PanickingClient {
            fn inpaint(&self, _: &RgbaImage, _: &GrayImage) -> Result<RemoteInpaint, RemoteError> {
                panic!("backend exploded");
            }
        }
        let pipeline = RemovalPipeline::new(networked(5), quota(5)).with_client(Arc::new(PanickingClient));
        let mut session = RemovalSession::new(pipeline);
        session.activate(gradient(64, 64)).unwrap();
        session.add_stroke(big_stroke()).unwrap();
        assert_eq!(session.commit().unwrap().paths(), vec![RemovalPath::Local]);
    }

    #[test]
    fn worker_panic_restores_the_pre_commit_buffer() {
        let mut session = RemovalSession::new(RemovalPipeline::new(RemovalSettings::default(), quota(0)));
        let img = gradient(64, 64);
        session.activate(img.clone()).unwrap();

        let (tx, rx) = mpsc::channel();
        let backup = session.take_buffer().unwrap();
        session.in_flight = Some(InFlight {
            rx,
            backup,
            strokes: vec![big_stroke()],
        });
        tx.send(WorkerReply::Panicked).unwrap();

        assert_eq!(session.poll_commit(), Some(Err(RemovalError::WorkerPanicked)));
        assert_eq!(session.buffer(), Some(&img));
        assert_eq!(session.pending_strokes().len(), 1);
        assert_eq!(session.poll_commit(), None);
    }
}
