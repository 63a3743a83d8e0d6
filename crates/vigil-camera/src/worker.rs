//! Per-source capture worker.
//!
//! Owns one camera's lifecycle on a dedicated OS thread: open, read
//! loop, health tracking, reconnect with backoff, graceful stop. Frames
//! that read successfully are handed to the frame callback
//! synchronously; a slow callback throttles this source only.

use crate::capture::{CameraSpec, CaptureBackend, FrameStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use vigil_core::{CameraStatus, Frame, IdentityStore};

/// Frame sink shared by all workers, invoked as `(source_id, frame)`.
pub type FrameCallback = Arc<dyn Fn(i64, Frame) + Send + Sync>;

/// Worker tuning knobs.
#[derive(Clone)]
pub struct WorkerConfig {
    /// Pacing between successful reads; bounds the per-source frame
    /// rate.
    pub frame_interval: Duration,
    /// Consecutive failed reads before the capture handle is recycled.
    pub failure_threshold: u32,
    /// Backoff between open attempts and after a forced reconnect.
    pub reconnect_backoff: Duration,
    /// Backoff after a single transient read failure.
    pub read_backoff: Duration,
    /// How long `stop()` waits for the loop to exit before proceeding
    /// with cleanup.
    pub stop_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(1000 / 15),
            failure_threshold: 20,
            reconnect_backoff: Duration::from_secs(1),
            read_backoff: Duration::from_millis(50),
            stop_timeout: Duration::from_secs(2),
        }
    }
}

pub struct CameraWorker {
    spec: CameraSpec,
    backend: Arc<dyn CaptureBackend>,
    store: Arc<dyn IdentityStore>,
    on_frame: FrameCallback,
    config: WorkerConfig,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
    done_rx: Option<mpsc::Receiver<()>>,
}

impl CameraWorker {
    pub fn new(
        spec: CameraSpec,
        backend: Arc<dyn CaptureBackend>,
        store: Arc<dyn IdentityStore>,
        on_frame: FrameCallback,
        config: WorkerConfig,
    ) -> Self {
        Self {
            spec,
            backend,
            store,
            on_frame,
            config,
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
            done_rx: None,
        }
    }

    pub fn spec(&self) -> &CameraSpec {
        &self.spec
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Start the capture loop. No-op when the loop is already running,
    /// so one worker never drives two concurrent loops.
    ///
    /// Each start allocates its own stop flag: a loop abandoned by a
    /// timed-out `stop()` keeps its old flag permanently set and can
    /// never be revived by a later start.
    pub fn start(&mut self) {
        if self.is_running() {
            tracing::debug!(source = self.spec.id, "worker already running");
            return;
        }
        self.stop = Arc::new(AtomicBool::new(false));

        let (done_tx, done_rx) = mpsc::channel();
        let ctx = LoopCtx {
            spec: self.spec.clone(),
            backend: Arc::clone(&self.backend),
            store: Arc::clone(&self.store),
            on_frame: Arc::clone(&self.on_frame),
            config: self.config.clone(),
            stop: Arc::clone(&self.stop),
        };

        let spawned = thread::Builder::new()
            .name(format!("camera-{}", self.spec.id))
            .spawn(move || {
                run_loop(ctx);
                let _ = done_tx.send(());
            });

        match spawned {
            Ok(handle) => {
                self.handle = Some(handle);
                self.done_rx = Some(done_rx);
                tracing::info!(source = self.spec.id, name = %self.spec.name, "worker started");
            }
            Err(e) => {
                tracing::error!(source = self.spec.id, error = %e, "failed to spawn worker thread");
            }
        }
    }

    /// Stop the capture loop and release the source.
    ///
    /// Idempotent and infallible: safe on a never-started or already
    /// stopped worker. Waits at most `stop_timeout` for the loop to
    /// observe the stop signal; a read blocked in the driver past that
    /// is abandoned rather than joined (the thread drops the handle on
    /// its own once the read returns). Always reports the source
    /// offline, best-effort.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);

        if let Some(done_rx) = self.done_rx.take() {
            match done_rx.recv_timeout(self.config.stop_timeout) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                    if let Some(handle) = self.handle.take() {
                        let _ = handle.join();
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    tracing::warn!(
                        source = self.spec.id,
                        "worker did not stop within timeout; abandoning thread"
                    );
                    self.handle.take();
                }
            }
        }

        report_status(&self.store, self.spec.id, CameraStatus::Offline);
        tracing::info!(source = self.spec.id, "worker stopped");
    }
}

struct LoopCtx {
    spec: CameraSpec,
    backend: Arc<dyn CaptureBackend>,
    store: Arc<dyn IdentityStore>,
    on_frame: FrameCallback,
    config: WorkerConfig,
    stop: Arc<AtomicBool>,
}

fn run_loop(ctx: LoopCtx) {
    let mut stream: Option<Box<dyn FrameStream>> = None;
    let mut failures = 0u32;
    let mut online = false;

    while !ctx.stop.load(Ordering::SeqCst) {
        if stream.is_none() {
            match ctx.backend.open(&ctx.spec) {
                Ok(s) => {
                    stream = Some(s);
                    failures = 0;
                    if !online {
                        report_status(&ctx.store, ctx.spec.id, CameraStatus::Online);
                        online = true;
                        tracing::info!(source = ctx.spec.id, "source online");
                    }
                }
                Err(e) => {
                    tracing::debug!(source = ctx.spec.id, error = %e, "open failed; retrying");
                    if online {
                        report_status(&ctx.store, ctx.spec.id, CameraStatus::Offline);
                        online = false;
                    }
                    thread::sleep(ctx.config.reconnect_backoff);
                    continue;
                }
            }
        }

        let Some(s) = stream.as_mut() else {
            continue;
        };

        match s.read() {
            Ok(frame) => {
                // A stop racing a blocked read must not deliver the
                // frame it was blocked on.
                if ctx.stop.load(Ordering::SeqCst) {
                    break;
                }
                failures = 0;
                (ctx.on_frame)(ctx.spec.id, frame);
                thread::sleep(ctx.config.frame_interval);
            }
            Err(e) => {
                failures += 1;
                if failures >= ctx.config.failure_threshold {
                    tracing::warn!(
                        source = ctx.spec.id,
                        failures,
                        error = %e,
                        "read failure threshold reached; reconnecting"
                    );
                    stream = None;
                    failures = 0;
                    report_status(&ctx.store, ctx.spec.id, CameraStatus::Offline);
                    online = false;
                    thread::sleep(ctx.config.reconnect_backoff);
                } else {
                    tracing::trace!(source = ctx.spec.id, failures, error = %e, "transient read failure");
                    thread::sleep(ctx.config.read_backoff);
                }
            }
        }
    }
    // Dropping the stream releases the capture handle.
}

/// Status writes are telemetry: log failures, never propagate.
fn report_status(store: &Arc<dyn IdentityStore>, source_id: i64, status: CameraStatus) {
    if let Err(e) = store.set_source_status(source_id, status) {
        tracing::warn!(source = source_id, status = %status, error = %e, "status report failed");
    }
}
