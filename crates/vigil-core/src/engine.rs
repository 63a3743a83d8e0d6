//! Recognition/attendance engine.
//!
//! Converts one frame from one source into zero or more attendance side
//! effects: idempotent check-in on a gallery match, an unknown-face
//! snapshot on a miss, and check-out for identities unseen past the
//! absence timeout. Invoked concurrently by every camera worker; one
//! mutex serializes the identity cache and the last-seen map.

use crate::analyzer::FaceAnalyzer;
use crate::frame::Frame;
use crate::store::{IdentityStore, StoreError};
use crate::types::{CosineMatcher, FaceRegion, GalleryMatcher, KnownIdentity, MatchResult};
use chrono::{DateTime, Local};
use image::GrayImage;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Engine tuning knobs.
pub struct EngineConfig {
    /// Minimum cosine similarity for a positive identification.
    pub similarity_threshold: f32,
    /// Duration of no re-match after which an open attendance record is
    /// closed.
    pub absence_timeout: Duration,
    /// Maximum age of the cached identity list before a refresh is
    /// forced. New enrollments take up to this long to become visible.
    pub cache_staleness: Duration,
    /// Directory for unknown-face snapshots.
    pub snapshot_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.6,
            absence_timeout: Duration::from_secs(10 * 60),
            cache_staleness: Duration::from_secs(30),
            snapshot_dir: PathBuf::from("data/unknown_snapshots"),
        }
    }
}

#[derive(Error, Debug)]
enum SnapshotError {
    #[error("region has no pixels inside the frame")]
    EmptyCrop,
    #[error("crop buffer mismatch")]
    BadBuffer,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
}

/// In-memory engine state guarded by one lock.
///
/// `last_seen` is deliberately lossy: it is not persisted, so an open
/// attendance record with no entry here will not auto-checkout until
/// the identity is matched again after a restart.
struct EngineState {
    /// Identity cache in store order; matching preserves this order for
    /// deterministic tie-breaks.
    gallery: Vec<KnownIdentity>,
    last_seen: HashMap<i64, DateTime<Local>>,
    last_loaded: Option<DateTime<Local>>,
}

pub struct RecognitionEngine {
    store: Arc<dyn IdentityStore>,
    analyzer: Box<dyn FaceAnalyzer>,
    matcher: CosineMatcher,
    threshold: f32,
    absence_timeout: chrono::Duration,
    cache_staleness: chrono::Duration,
    snapshot_dir: PathBuf,
    state: Mutex<EngineState>,
}

impl RecognitionEngine {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        analyzer: Box<dyn FaceAnalyzer>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            analyzer,
            matcher: CosineMatcher,
            threshold: config.similarity_threshold,
            absence_timeout: chrono::Duration::from_std(config.absence_timeout)
                .unwrap_or(chrono::Duration::MAX),
            cache_staleness: chrono::Duration::from_std(config.cache_staleness)
                .unwrap_or(chrono::Duration::MAX),
            snapshot_dir: config.snapshot_dir,
            state: Mutex::new(EngineState {
                gallery: Vec::new(),
                last_seen: HashMap::new(),
                last_loaded: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refresh the identity cache from the store.
    ///
    /// On failure the prior cache is retained and the error propagates;
    /// the engine keeps matching against stale-but-valid data.
    pub fn load_known_faces(&self) -> Result<usize, StoreError> {
        self.load_known_faces_at(Local::now())
    }

    fn load_known_faces_at(&self, now: DateTime<Local>) -> Result<usize, StoreError> {
        let identities = self.store.fetch_known_identities()?;
        let count = identities.len();
        let mut state = self.state();
        state.gallery = identities;
        state.last_loaded = Some(now);
        tracing::debug!(count, "identity cache refreshed");
        Ok(count)
    }

    /// Process one frame from one source. Never fails: store and
    /// snapshot errors are logged and swallowed so the recognition path
    /// keeps running.
    pub fn process_frame(&self, source_id: i64, frame: &Frame) -> Vec<MatchResult> {
        self.process_frame_at(source_id, frame, Local::now())
    }

    fn process_frame_at(
        &self,
        source_id: i64,
        frame: &Frame,
        now: DateTime<Local>,
    ) -> Vec<MatchResult> {
        if let Err(e) = self.refresh_if_stale(now) {
            tracing::warn!(error = %e, "identity cache refresh failed; matching against stale cache");
        }

        let regions = self.analyzer.detect(frame);
        let mut results = Vec::with_capacity(regions.len());

        let mut state = self.state();
        let mut unknowns: Vec<FaceRegion> = Vec::new();
        for region in &regions {
            let probe = self.analyzer.embed(frame, region);
            let hit = self
                .matcher
                .best_match(&probe, &state.gallery)
                .filter(|h| h.similarity >= self.threshold);

            match hit {
                Some(h) => {
                    let id = state.gallery[h.index].id;
                    let name = state.gallery[h.index].name.clone();
                    if let Err(e) = self.store.upsert_check_in(id, now) {
                        tracing::warn!(identity = id, error = %e, "check-in write failed");
                    }
                    state.last_seen.insert(id, now);
                    tracing::info!(
                        identity = id,
                        name = %name,
                        similarity = h.similarity,
                        source = source_id,
                        "identity matched"
                    );
                    results.push(MatchResult {
                        identity_id: Some(id),
                        identity_name: Some(name),
                        region: *region,
                        distance: Some(1.0 - h.similarity),
                    });
                }
                None => {
                    unknowns.push(*region);
                    results.push(MatchResult::unknown(*region));
                }
            }
        }

        // Runs on every processed frame, detections or not, so absence
        // resolution is bounded by aggregate frame throughput.
        self.sweep_absences(&mut state, now);
        drop(state);

        // Snapshot encode and disk write happen off the state lock so
        // one slow write cannot stall the other sources' frames.
        for region in &unknowns {
            self.save_unknown(frame, region, now);
        }

        results
    }

    fn refresh_if_stale(&self, now: DateTime<Local>) -> Result<(), StoreError> {
        let stale = {
            let state = self.state();
            match state.last_loaded {
                None => true,
                Some(loaded) => now - loaded > self.cache_staleness,
            }
        };
        if stale {
            self.load_known_faces_at(now)?;
        }
        Ok(())
    }

    /// Close attendance for every identity unseen past the timeout and
    /// drop it from last-seen tracking. Checkout fires once per open
    /// record even when the store write fails.
    fn sweep_absences(&self, state: &mut EngineState, now: DateTime<Local>) {
        let expired: Vec<i64> = state
            .last_seen
            .iter()
            .filter(|(_, &seen)| now - seen >= self.absence_timeout)
            .map(|(&id, _)| id)
            .collect();

        for id in expired {
            if let Err(e) = self.store.set_check_out(id, now) {
                tracing::warn!(identity = id, error = %e, "check-out write failed");
            }
            state.last_seen.remove(&id);
            tracing::info!(identity = id, "absence timeout reached; checked out");
        }
    }

    /// Persist a cropped snapshot of an unrecognized face. Best-effort:
    /// any failure is logged and the recognition path continues.
    fn save_unknown(&self, frame: &Frame, region: &FaceRegion, now: DateTime<Local>) {
        let path = self
            .snapshot_dir
            .join(format!("unknown_{}.png", now.format("%Y%m%d_%H%M%S_%f")));

        match self.write_snapshot(frame, region, &path) {
            Ok(()) => {
                if let Err(e) = self.store.log_unknown(&path, now) {
                    tracing::warn!(error = %e, path = %path.display(), "unknown-event write failed");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "unknown snapshot not saved");
            }
        }
    }

    fn write_snapshot(
        &self,
        frame: &Frame,
        region: &FaceRegion,
        path: &Path,
    ) -> Result<(), SnapshotError> {
        let x0 = region.left.clamp(0, frame.width as i64) as u32;
        let x1 = region.right.clamp(0, frame.width as i64) as u32;
        let y0 = region.top.clamp(0, frame.height as i64) as u32;
        let y1 = region.bottom.clamp(0, frame.height as i64) as u32;

        let w = x1.saturating_sub(x0);
        let h = y1.saturating_sub(y0);
        if w == 0 || h == 0 {
            return Err(SnapshotError::EmptyCrop);
        }

        if frame.data.len() < (frame.width * frame.height) as usize {
            return Err(SnapshotError::BadBuffer);
        }

        let mut data = Vec::with_capacity((w * h) as usize);
        for y in y0..y1 {
            let row = (y * frame.width + x0) as usize;
            data.extend_from_slice(&frame.data[row..row + w as usize]);
        }

        let img = GrayImage::from_raw(w, h, data).ok_or(SnapshotError::BadBuffer)?;
        std::fs::create_dir_all(&self.snapshot_dir)?;
        img.save(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CameraStatus, Descriptor};
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    /// In-memory store emulating the contract, including check-in
    /// idempotency per identity+date.
    #[derive(Default)]
    struct MemStore {
        identities: Mutex<Vec<KnownIdentity>>,
        attendance: Mutex<Vec<AttendanceRow>>,
        unknowns: Mutex<Vec<PathBuf>>,
        fail_fetch: AtomicBool,
    }

    #[derive(Clone)]
    struct AttendanceRow {
        identity_id: i64,
        date: String,
        in_time: DateTime<Local>,
        out_time: Option<DateTime<Local>>,
    }

    impl IdentityStore for MemStore {
        fn fetch_known_identities(&self) -> Result<Vec<KnownIdentity>, StoreError> {
            if self.fail_fetch.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("fetch disabled".into()));
            }
            Ok(self.identities.lock().unwrap().clone())
        }

        fn upsert_check_in(&self, identity_id: i64, at: DateTime<Local>) -> Result<i64, StoreError> {
            let date = at.format("%Y-%m-%d").to_string();
            let mut rows = self.attendance.lock().unwrap();
            if let Some(pos) = rows
                .iter()
                .position(|r| r.identity_id == identity_id && r.date == date)
            {
                return Ok(pos as i64);
            }
            rows.push(AttendanceRow {
                identity_id,
                date,
                in_time: at,
                out_time: None,
            });
            Ok(rows.len() as i64 - 1)
        }

        fn set_check_out(&self, identity_id: i64, at: DateTime<Local>) -> Result<(), StoreError> {
            let date = at.format("%Y-%m-%d").to_string();
            let mut rows = self.attendance.lock().unwrap();
            if let Some(row) = rows
                .iter_mut()
                .find(|r| r.identity_id == identity_id && r.date == date)
            {
                row.out_time = Some(at);
            }
            Ok(())
        }

        fn log_unknown(&self, snapshot: &Path, _at: DateTime<Local>) -> Result<i64, StoreError> {
            let mut v = self.unknowns.lock().unwrap();
            v.push(snapshot.to_path_buf());
            Ok(v.len() as i64)
        }

        fn set_source_status(&self, _source_id: i64, _status: CameraStatus) -> Result<(), StoreError> {
            Ok(())
        }
    }

    /// Analyzer whose detections are scripted per call; descriptors are
    /// looked up by the region's left edge.
    struct ScriptedAnalyzer {
        detections: Mutex<VecDeque<Vec<FaceRegion>>>,
        by_left: HashMap<i64, Vec<f32>>,
    }

    impl ScriptedAnalyzer {
        fn new(detections: Vec<Vec<FaceRegion>>, by_left: HashMap<i64, Vec<f32>>) -> Self {
            Self {
                detections: Mutex::new(detections.into()),
                by_left,
            }
        }
    }

    impl FaceAnalyzer for ScriptedAnalyzer {
        fn detect(&self, _frame: &Frame) -> Vec<FaceRegion> {
            self.detections.lock().unwrap().pop_front().unwrap_or_default()
        }

        fn embed(&self, _frame: &Frame, region: &FaceRegion) -> Descriptor {
            Descriptor::new(
                self.by_left
                    .get(&region.left)
                    .cloned()
                    .unwrap_or_else(|| vec![0.0, 0.0]),
            )
        }
    }

    fn region(left: i64) -> FaceRegion {
        FaceRegion {
            top: 0,
            right: left + 16,
            bottom: 16,
            left,
        }
    }

    fn test_frame() -> Frame {
        Frame::new(vec![128u8; 64 * 64], 64, 64)
    }

    fn known(id: i64, name: &str, values: Vec<f32>) -> KnownIdentity {
        KnownIdentity {
            id,
            name: name.into(),
            descriptor: Descriptor::new(values),
        }
    }

    fn engine_with(
        store: Arc<MemStore>,
        analyzer: ScriptedAnalyzer,
        snapshot_dir: &Path,
    ) -> RecognitionEngine {
        RecognitionEngine::new(
            store,
            Box::new(analyzer),
            EngineConfig {
                snapshot_dir: snapshot_dir.to_path_buf(),
                ..EngineConfig::default()
            },
        )
    }

    fn minutes(m: i64) -> chrono::Duration {
        chrono::Duration::minutes(m)
    }

    /// Fixed mid-morning instant so tests never straddle midnight.
    fn nine_am() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 8, 28, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_match_checks_in_and_tracks_last_seen() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::default());
        store.identities.lock().unwrap().push(known(7, "ada", vec![1.0, 0.0]));

        let analyzer = ScriptedAnalyzer::new(
            vec![vec![region(0)]],
            HashMap::from([(0, vec![1.0, 0.0])]),
        );
        let engine = engine_with(store.clone(), analyzer, dir.path());

        let t0 = nine_am();
        let results = engine.process_frame_at(1, &test_frame(), t0);

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].identity_id, Some(7));
        assert_eq!(results[0].identity_name.as_deref(), Some("ada"));
        assert!(results[0].distance.unwrap() < 1e-6);
        assert_eq!(store.attendance.lock().unwrap().len(), 1);
        assert_eq!(engine.state().last_seen.get(&7), Some(&t0));
    }

    #[test]
    fn test_check_in_is_idempotent_per_day() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::default());
        store.identities.lock().unwrap().push(known(7, "ada", vec![1.0, 0.0]));

        let analyzer = ScriptedAnalyzer::new(
            vec![vec![region(0)], vec![region(0)]],
            HashMap::from([(0, vec![1.0, 0.0])]),
        );
        let engine = engine_with(store.clone(), analyzer, dir.path());

        let t0 = nine_am();
        engine.process_frame_at(1, &test_frame(), t0);
        engine.process_frame_at(1, &test_frame(), t0 + minutes(1));

        let rows = store.attendance.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].in_time, t0, "second match must not move the in-time");
    }

    #[test]
    fn test_unknown_faces_log_events_not_attendance() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::default());
        {
            let mut ids = store.identities.lock().unwrap();
            ids.push(known(1, "ada", vec![1.0, 0.0]));
            ids.push(known(2, "bo", vec![0.0, 1.0]));
        }

        // Three faces, none similar enough to either identity.
        let stranger = vec![0.5f32, -0.866];
        let analyzer = ScriptedAnalyzer::new(
            vec![
                vec![region(0)],
                vec![region(16)],
                vec![region(32)],
            ],
            HashMap::from([
                (0, stranger.clone()),
                (16, stranger.clone()),
                (32, stranger),
            ]),
        );
        let engine = engine_with(store.clone(), analyzer, dir.path());

        let t0 = nine_am();
        for i in 0..3 {
            let results = engine.process_frame_at(1, &test_frame(), t0 + minutes(i));
            assert_eq!(results[0].identity_id, None);
        }

        assert_eq!(store.unknowns.lock().unwrap().len(), 3);
        assert_eq!(store.attendance.lock().unwrap().len(), 0);
        // Snapshots actually landed on disk.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 3);
    }

    #[test]
    fn test_absence_sweep_closes_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::default());
        store.identities.lock().unwrap().push(known(7, "ada", vec![1.0, 0.0]));

        let analyzer = ScriptedAnalyzer::new(
            vec![vec![region(0)]], // later frames detect nothing
            HashMap::from([(0, vec![1.0, 0.0])]),
        );
        let engine = engine_with(store.clone(), analyzer, dir.path());

        let t0 = nine_am();
        engine.process_frame_at(1, &test_frame(), t0);
        assert!(store.attendance.lock().unwrap()[0].out_time.is_none());

        // Below the timeout: still open.
        engine.process_frame_at(1, &test_frame(), t0 + minutes(9));
        assert!(store.attendance.lock().unwrap()[0].out_time.is_none());

        // Past the timeout, on a faceless frame: closed and untracked.
        let t11 = t0 + minutes(11);
        engine.process_frame_at(1, &test_frame(), t11);
        assert_eq!(store.attendance.lock().unwrap()[0].out_time, Some(t11));
        assert!(engine.state().last_seen.is_empty());

        // A later sweep must not fire again.
        engine.process_frame_at(1, &test_frame(), t0 + minutes(20));
        assert_eq!(store.attendance.lock().unwrap()[0].out_time, Some(t11));
    }

    #[test]
    fn test_new_enrollment_invisible_until_staleness_window() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::default());
        store.identities.lock().unwrap().push(known(1, "ada", vec![1.0, 0.0]));

        let analyzer = ScriptedAnalyzer::new(
            vec![vec![region(0)], vec![region(0)]],
            HashMap::from([(0, vec![0.0, 1.0])]), // matches bo only
        );
        let engine = engine_with(store.clone(), analyzer, dir.path());

        let t0 = nine_am();
        engine.load_known_faces_at(t0).unwrap();

        // Enroll bo after the initial load.
        store.identities.lock().unwrap().push(known(2, "bo", vec![0.0, 1.0]));

        // Within the window: cache not refreshed, bo unmatched.
        let results = engine.process_frame_at(1, &test_frame(), t0 + chrono::Duration::seconds(5));
        assert_eq!(results[0].identity_id, None);

        // Past the window: refresh picks bo up.
        let results = engine.process_frame_at(1, &test_frame(), t0 + chrono::Duration::seconds(31));
        assert_eq!(results[0].identity_id, Some(2));
    }

    #[test]
    fn test_refresh_failure_retains_prior_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::default());
        store.identities.lock().unwrap().push(known(1, "ada", vec![1.0, 0.0]));

        let analyzer = ScriptedAnalyzer::new(
            vec![vec![region(0)]],
            HashMap::from([(0, vec![1.0, 0.0])]),
        );
        let engine = engine_with(store.clone(), analyzer, dir.path());

        let t0 = nine_am();
        engine.load_known_faces_at(t0).unwrap();
        store.fail_fetch.store(true, Ordering::SeqCst);

        // Refresh is due and fails; matching continues on the old cache.
        let results = engine.process_frame_at(1, &test_frame(), t0 + minutes(5));
        assert_eq!(results[0].identity_id, Some(1));
    }

    #[test]
    fn test_degenerate_region_is_unknown_without_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::default());
        store.identities.lock().unwrap().push(known(1, "ada", vec![1.0, 0.0]));

        let degenerate = FaceRegion { top: 5, right: 9, bottom: 5, left: 9 };
        let analyzer = ScriptedAnalyzer::new(vec![vec![degenerate]], HashMap::new());
        let engine = engine_with(store.clone(), analyzer, dir.path());

        let results = engine.process_frame_at(1, &test_frame(), nine_am());
        assert_eq!(results[0].identity_id, None);
        // Zero-area crop cannot be encoded; the event is dropped, not raised.
        assert!(store.unknowns.lock().unwrap().is_empty());
    }

    /// Store whose unknown-event write parks until released.
    #[derive(Default)]
    struct GatedStore {
        inner: MemStore,
        in_log: AtomicBool,
        release: AtomicBool,
    }

    impl IdentityStore for GatedStore {
        fn fetch_known_identities(&self) -> Result<Vec<KnownIdentity>, StoreError> {
            self.inner.fetch_known_identities()
        }
        fn upsert_check_in(&self, identity_id: i64, at: DateTime<Local>) -> Result<i64, StoreError> {
            self.inner.upsert_check_in(identity_id, at)
        }
        fn set_check_out(&self, identity_id: i64, at: DateTime<Local>) -> Result<(), StoreError> {
            self.inner.set_check_out(identity_id, at)
        }
        fn log_unknown(&self, snapshot: &Path, at: DateTime<Local>) -> Result<i64, StoreError> {
            self.in_log.store(true, Ordering::SeqCst);
            while !self.release.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
            self.inner.log_unknown(snapshot, at)
        }
        fn set_source_status(&self, source_id: i64, status: CameraStatus) -> Result<(), StoreError> {
            self.inner.set_source_status(source_id, status)
        }
    }

    #[test]
    fn test_slow_unknown_write_does_not_stall_other_sources() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(GatedStore::default());
        store.inner.identities.lock().unwrap().push(known(7, "ada", vec![1.0, 0.0]));

        // First frame carries an unknown face, second a known one.
        let analyzer = ScriptedAnalyzer::new(
            vec![vec![region(16)], vec![region(0)]],
            HashMap::from([(0, vec![1.0, 0.0])]),
        );
        let engine = RecognitionEngine::new(
            store.clone(),
            Box::new(analyzer),
            EngineConfig {
                snapshot_dir: dir.path().to_path_buf(),
                ..EngineConfig::default()
            },
        );

        thread::scope(|s| {
            s.spawn(|| {
                engine.process_frame_at(1, &test_frame(), nine_am());
            });
            while !store.in_log.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }

            // With the unknown-event write stuck, another source's
            // frame must still match and check in.
            let results = engine.process_frame_at(2, &test_frame(), nine_am());
            assert_eq!(results[0].identity_id, Some(7));

            store.release.store(true, Ordering::SeqCst);
        });

        assert_eq!(store.inner.unknowns.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_initial_load_propagates_fetch_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::default());
        store.fail_fetch.store(true, Ordering::SeqCst);

        let analyzer = ScriptedAnalyzer::new(Vec::new(), HashMap::new());
        let engine = engine_with(store, analyzer, dir.path());

        assert!(engine.load_known_faces().is_err());
    }
}
