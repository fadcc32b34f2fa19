use super::stop::StopToken;
use crate::config::Config;
use crate::learner::Kind;
use crate::learner::Learner;
use crate::learner::Metrics;
use crate::learner::Session;
use crate::learner::SharedLearner as Shared;
use crate::save::SaveReason;
use crate::save::Vault;
use crate::selfplay::Driver;
use crate::selfplay::Outcome;
use crate::selfplay::Trajectory;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// episodes a worker trains per lock acquisition. small, so the
/// periodic saver's snapshot and the dispatcher's lane can interleave
/// between chunks.
const CHUNK: u64 = 1;

struct Inner {
    learners: BTreeMap<Kind, Shared>,
    degraded: BTreeMap<Kind, AtomicBool>,
    vault: Arc<Vault>,
    driver: Arc<Driver>,
    stop: StopToken,
    active: AtomicBool,
    stop_requested: AtomicBool,
    retired: AtomicBool,
    stop_timeout: Duration,
    final_save_timeout: Duration,
    save_interval: Duration,
}

impl Inner {
    /// snapshot every dirty learner and hand the bytes to the vault.
    /// a clean system is a no-op; failures re-flag the kind.
    fn save_all(&self, reason: SaveReason) {
        let dirty = self.vault.dirty();
        let kinds = dirty.take();
        if kinds.is_empty() {
            log::debug!("{} save: nothing dirty", reason);
            return;
        }
        log::info!("{} save of {} learner(s)", reason, kinds.len());
        for kind in kinds {
            let Some(learner) = self.learners.get(&kind) else {
                continue;
            };
            // the snapshot is the only cross-thread read of learner
            // state, taken under a briefly-held lock
            let snapshot = learner.lock().expect("learner lock").snapshot();
            match snapshot {
                Err(e) => {
                    log::error!("{} snapshot failed: {}", kind, e);
                    dirty.mark(kind);
                }
                Ok(parts) => {
                    for (file, bytes) in parts {
                        let written = match reason {
                            // the stop save must be on disk before we return
                            SaveReason::Stop => self.vault.save(kind, file, &bytes),
                            _ => self.vault.store(kind, file, bytes),
                        };
                        if let Err(e) = written {
                            log::error!("{} save of {} failed: {}", kind, file, e);
                            dirty.mark(kind);
                        }
                    }
                }
            }
        }
    }
}

struct Worker {
    kind: Kind,
    finished: crossbeam_channel::Receiver<()>,
    handle: std::thread::JoinHandle<()>,
}

/// process-wide training lifecycle: spawns one worker per enabled
/// learner plus the periodic saver, enforces the single-run invariant,
/// and winds everything down inside bounded timeouts. never touches
/// learner model bytes.
pub struct Coordinator {
    inner: Arc<Inner>,
    workers: Mutex<Vec<Worker>>,
    saver: Mutex<Option<(crossbeam_channel::Sender<()>, std::thread::JoinHandle<()>)>>,
}

impl Coordinator {
    pub fn new(
        config: &Config,
        learners: Vec<Box<dyn Learner>>,
        vault: Arc<Vault>,
        driver: Arc<Driver>,
    ) -> Self {
        let learners = learners
            .into_iter()
            .map(|l| (l.kind(), Arc::new(Mutex::new(l))))
            .collect::<BTreeMap<_, _>>();
        let degraded = learners
            .keys()
            .map(|k| (*k, AtomicBool::new(false)))
            .collect();
        Self {
            inner: Arc::new(Inner {
                learners,
                degraded,
                vault,
                driver,
                stop: StopToken::new(),
                active: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                retired: AtomicBool::new(false),
                stop_timeout: Duration::from_secs(config.stop_timeout_seconds),
                final_save_timeout: Duration::from_secs(crate::FINAL_SAVE_TIMEOUT_SECONDS),
                save_interval: Duration::from_secs(config.periodic_save_minutes * 60),
            }),
            workers: Mutex::new(Vec::new()),
            saver: Mutex::new(None),
        }
    }

    pub fn active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn stop_requested(&self) -> bool {
        self.inner.stop_requested.load(Ordering::SeqCst)
    }

    /// checkpoint every dirty learner right now. a clean system is a
    /// no-op.
    pub fn save_all(&self, reason: SaveReason) {
        self.inner.save_all(reason);
    }

    pub fn kinds(&self) -> Vec<Kind> {
        self.inner.learners.keys().copied().collect()
    }

    pub fn learner(&self, kind: Kind) -> Option<Shared> {
        self.inner.learners.get(&kind).cloned()
    }

    pub fn metrics(&self) -> BTreeMap<Kind, Metrics> {
        self.inner
            .learners
            .iter()
            .map(|(kind, learner)| {
                let mut metrics = learner.lock().expect("learner lock").metrics();
                let degraded = self.inner.degraded[kind].load(Ordering::SeqCst);
                metrics.set("degraded", degraded as u8 as f64);
                (*kind, metrics)
            })
            .collect()
    }

    /// hand a finished human game to one learner
    pub fn absorb(&self, kind: Kind, trajectory: &Trajectory, outcome: Outcome) {
        if let Some(learner) = self.inner.learners.get(&kind) {
            let mut guard = learner.lock().expect("learner lock");
            guard.absorb(trajectory, outcome);
            self.inner.vault.dirty().mark(kind);
        }
    }

    /// begin one training session across the whole stable. a no-op
    /// while a session is active or after shutdown.
    pub fn start_training(&self, budget: u64) {
        if self.inner.retired.load(Ordering::SeqCst) {
            log::warn!("start_training ignored: coordinator is shut down");
            return;
        }
        if self.inner.active.swap(true, Ordering::SeqCst) {
            log::warn!("start_training ignored: session already active");
            return;
        }
        self.inner.stop_requested.store(false, Ordering::SeqCst);
        self.inner.stop.reset();
        self.inner.vault.resume();
        for flag in self.inner.degraded.values() {
            flag.store(false, Ordering::SeqCst);
        }
        log::info!(
            "training session started: {} learner(s), budget {} episodes",
            self.inner.learners.len(),
            budget
        );
        self.spawn_saver();
        let mut workers = self.workers.lock().expect("worker table lock");
        for (kind, learner) in &self.inner.learners {
            workers.push(self.spawn_worker(*kind, learner.clone(), budget));
        }
    }

    fn spawn_saver(&self) {
        let (tx, rx) = crossbeam_channel::bounded::<()>(1);
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name("periodic-saver".to_string())
            .spawn(move || {
                loop {
                    match rx.recv_timeout(inner.save_interval) {
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                            inner.save_all(SaveReason::Periodic)
                        }
                        _ => break,
                    }
                }
            })
            .expect("spawn periodic saver");
        *self.saver.lock().expect("saver slot lock") = Some((tx, handle));
    }

    fn spawn_worker(&self, kind: Kind, learner: Shared, budget: u64) -> Worker {
        let (done, finished) = crossbeam_channel::bounded::<()>(1);
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name(format!("{}-training", kind))
            .spawn(move || {
                let target = learner
                    .lock()
                    .expect("learner lock")
                    .metrics()
                    .episodes()
                    + budget;
                loop {
                    if inner.stop.stopped() {
                        break;
                    }
                    let mut guard = learner.lock().expect("learner lock");
                    let done = guard.metrics().episodes();
                    if done >= target {
                        break;
                    }
                    let chunk = (CHUNK * guard.stride()).min(target - done);
                    let session = Session::new(
                        chunk,
                        inner.stop.clone(),
                        inner.driver.clone(),
                        inner.vault.dirty(),
                    );
                    // learner errors stop at this frame; the session
                    // survives with the learner marked degraded
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        guard.train(&session)
                    }));
                    drop(guard);
                    if outcome.is_err() {
                        log::error!("{} worker panicked; retiring it for this session", kind);
                        inner.degraded[&kind].store(true, Ordering::SeqCst);
                        break;
                    }
                }
                let _ = done.send(());
            })
            .expect("spawn training worker");
        Worker {
            kind,
            finished,
            handle,
        }
    }

    /// wind the session down: flags first, queued async saves cancelled,
    /// the saver interrupted, every worker given its bounded timeout,
    /// then one final synchronous checkpoint under the outer timeout.
    pub fn stop_training(&self) {
        if !self.inner.active.load(Ordering::SeqCst) {
            log::warn!("stop_training ignored: no active session");
            return;
        }
        // observers must see the request before the activation flip
        self.inner.stop_requested.store(true, Ordering::SeqCst);
        self.inner.active.store(false, Ordering::SeqCst);
        self.inner.stop.stop();
        self.inner.vault.suspend();
        if let Some((tx, handle)) = self.saver.lock().expect("saver slot lock").take() {
            drop(tx);
            let _ = handle.join();
        }
        let workers = std::mem::take(&mut *self.workers.lock().expect("worker table lock"));
        for worker in workers {
            if let Some(learner) = self.inner.learners.get(&worker.kind) {
                // cooperative teardown if the lock is free right now
                if let Ok(mut guard) = learner.try_lock() {
                    guard.halt();
                }
            }
            match worker.finished.recv_timeout(self.inner.stop_timeout) {
                Ok(()) => {
                    let _ = worker.handle.join();
                    log::info!("{} worker stopped", worker.kind);
                }
                Err(_) => {
                    log::warn!(
                        "{} worker missed the {}s stop window; abandoned",
                        worker.kind,
                        self.inner.stop_timeout.as_secs()
                    );
                }
            }
        }
        self.final_save();
        log::info!("training session stopped");
    }

    /// the stop sequence plus a permanent ban on future starts
    pub fn shutdown(&self) {
        if self.inner.active.load(Ordering::SeqCst) {
            self.stop_training();
        }
        self.inner.retired.store(true, Ordering::SeqCst);
        log::info!("coordinator shut down");
    }

    fn final_save(&self) {
        let (tx, rx) = crossbeam_channel::bounded::<()>(1);
        let inner = self.inner.clone();
        let saver = std::thread::Builder::new()
            .name("final-save".to_string())
            .spawn(move || {
                inner.save_all(SaveReason::Stop);
                let _ = tx.send(());
            })
            .expect("spawn final save");
        match rx.recv_timeout(self.inner.final_save_timeout) {
            Ok(()) => {
                let _ = saver.join();
            }
            Err(_) => log::error!(
                "final save missed the {}s window; abandoned",
                self.inner.final_save_timeout.as_secs()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learner::Registry;

    fn runtime(dir: &std::path::Path, kinds: &[Kind]) -> Coordinator {
        let mut config = Config::default();
        config.enabled = kinds.to_vec();
        config.state_dir = dir.to_path_buf();
        let vault = Arc::new(Vault::new(dir, false).expect("vault"));
        let learners = Registry::stable(&config, &vault);
        Coordinator::new(&config, learners, vault, Arc::new(Driver::new()))
    }

    fn wait_for_episodes(coordinator: &Coordinator, kind: Kind, n: u64) {
        for _ in 0..600 {
            if coordinator.metrics()[&kind].episodes() >= n {
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        panic!("never reached {} episodes", n);
    }

    #[test]
    fn cold_start_reports_zero_everywhere() {
        let dir = tempfile::tempdir().expect("tempdir");
        let coordinator = runtime(dir.path(), &[Kind::QTable, Kind::Dqn]);
        for (_, metrics) in coordinator.metrics() {
            assert!(metrics.episodes() == 0);
            assert!(metrics.get("steps") == 0.);
        }
        // no checkpoint files exist yet
        let files = std::fs::read_dir(dir.path()).expect("read dir").count();
        assert!(files == 0);
    }

    #[test]
    fn start_is_single_run_and_stop_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let coordinator = runtime(dir.path(), &[Kind::QTable]);
        coordinator.start_training(1_000_000);
        assert!(coordinator.active());
        // second start is a logged no-op; exactly one session exists
        coordinator.start_training(1_000_000);
        assert!(coordinator.workers.lock().expect("lock").len() == 1);
        coordinator.stop_training();
        assert!(!coordinator.active());
        coordinator.stop_training();
        assert!(!coordinator.active());
    }

    #[test]
    fn train_stop_restore_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let trained = {
            let coordinator = runtime(dir.path(), &[Kind::QTable]);
            coordinator.start_training(1_000_000);
            wait_for_episodes(&coordinator, Kind::QTable, 10);
            coordinator.stop_training();
            coordinator.metrics()[&Kind::QTable].episodes()
        };
        assert!(trained >= 10);
        // a fresh process restores at least the stop save
        let coordinator = runtime(dir.path(), &[Kind::QTable]);
        let restored = coordinator.metrics()[&Kind::QTable].episodes();
        assert!(restored == trained);
        // and nothing was quarantined along the way
        let corrupt = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".corrupt."))
            .count();
        assert!(corrupt == 0);
    }

    #[test]
    fn workers_exit_within_the_stop_window() {
        let dir = tempfile::tempdir().expect("tempdir");
        let coordinator = runtime(dir.path(), &[Kind::QTable, Kind::Value]);
        coordinator.start_training(1_000_000);
        wait_for_episodes(&coordinator, Kind::QTable, 1);
        let begun = std::time::Instant::now();
        coordinator.stop_training();
        assert!(begun.elapsed() < Duration::from_secs(crate::STOP_TIMEOUT_SECONDS + 1 + 30));
        assert!(coordinator.workers.lock().expect("lock").is_empty());
    }

    #[test]
    fn save_all_clears_dirty_and_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let coordinator = runtime(dir.path(), &[Kind::QTable]);
        let dirty = coordinator.inner.vault.dirty();
        dirty.mark(Kind::QTable);
        coordinator.save_all(SaveReason::Reset);
        assert!(dirty.is_clean());
        assert!(dir.path().join("qtable.dat").exists());
        let written = std::fs::metadata(dir.path().join("qtable.dat"))
            .expect("stat")
            .modified()
            .expect("mtime");
        // a clean system saves nothing
        coordinator.save_all(SaveReason::Reset);
        let unchanged = std::fs::metadata(dir.path().join("qtable.dat"))
            .expect("stat")
            .modified()
            .expect("mtime");
        assert!(written == unchanged);
    }

    #[test]
    fn shutdown_forbids_future_starts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let coordinator = runtime(dir.path(), &[Kind::QTable]);
        coordinator.shutdown();
        coordinator.start_training(10);
        assert!(!coordinator.active());
    }

    #[test]
    fn corrupt_checkpoint_recovers_fresh_and_responsive() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let coordinator = runtime(dir.path(), &[Kind::QTable]);
            coordinator.start_training(1_000_000);
            wait_for_episodes(&coordinator, Kind::QTable, 1);
            coordinator.stop_training();
        }
        std::fs::write(dir.path().join("qtable.dat"), b"scribbled over").expect("write");
        let coordinator = runtime(dir.path(), &[Kind::QTable]);
        assert!(coordinator.metrics()[&Kind::QTable].episodes() == 0);
        let quarantined = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("qtable.dat.corrupt."))
            .count();
        assert!(quarantined == 1);
        // still able to train
        coordinator.start_training(1_000_000);
        wait_for_episodes(&coordinator, Kind::QTable, 1);
        coordinator.stop_training();
    }
}
