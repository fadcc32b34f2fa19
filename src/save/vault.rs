use super::SaveError;
use super::dirty::Dirty;
use super::header::Header;
use crate::SAVE_BACKOFF_MILLIS;
use crate::SAVE_QUEUE_DEPTH;
use crate::SAVE_RETRIES;
use crate::learner::Kind;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// why a save is happening; decides logging and little else, on purpose
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveReason {
    Periodic,
    Stop,
    Reset,
}

impl std::fmt::Display for SaveReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Periodic => write!(f, "periodic"),
            Self::Stop => write!(f, "stop"),
            Self::Reset => write!(f, "reset"),
        }
    }
}

struct Job {
    kind: Kind,
    file: &'static str,
    bytes: Vec<u8>,
}

/// the checkpoint manager. one public surface over two write paths:
/// a synchronous atomic write, and a bounded queue drained by an io
/// worker that performs the identical sequence. files are whole or
/// absent, never partial.
pub struct Vault {
    dir: PathBuf,
    dirty: Dirty,
    nonce: AtomicU64,
    suspended: Arc<AtomicBool>,
    queue: Option<crossbeam_channel::Sender<Job>>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl Vault {
    pub fn new(dir: &Path, async_io: bool) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let mut vault = Self {
            dir: dir.to_path_buf(),
            dirty: Dirty::new(),
            nonce: AtomicU64::new(0),
            suspended: Arc::new(AtomicBool::new(false)),
            queue: None,
            worker: None,
        };
        if async_io {
            let (tx, rx) = crossbeam_channel::bounded::<Job>(SAVE_QUEUE_DEPTH);
            let dir = vault.dir.clone();
            let suspended = vault.suspended.clone();
            let worker = std::thread::Builder::new()
                .name("checkpoint-io".to_string())
                .spawn(move || {
                    let nonce = AtomicU64::new(u64::MAX / 2);
                    for job in rx {
                        if suspended.load(Ordering::SeqCst) {
                            log::debug!("async save of {} dropped: queue suspended", job.file);
                            continue;
                        }
                        let path = dir.join(job.file);
                        match write_atomic(&path, job.kind, &job.bytes, &nonce) {
                            Ok(()) => log::debug!("async checkpoint {} written", job.file),
                            Err(e) => log::error!("async checkpoint {} failed: {}", job.file, e),
                        }
                    }
                })?;
            vault.queue = Some(tx);
            vault.worker = Some(worker);
        }
        Ok(vault)
    }

    /// the shared dirty-flag table handle learners mark
    pub fn dirty(&self) -> Dirty {
        self.dirty.clone()
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    /// synchronous path: scratch file, fsync, atomic rename
    pub fn save(&self, kind: Kind, file: &str, bytes: &[u8]) -> Result<(), SaveError> {
        write_atomic(&self.dir.join(file), kind, bytes, &self.nonce)?;
        Ok(())
    }

    /// async path: enqueue for the io worker. a full queue returns
    /// Backpressure and the caller falls back to the sync path.
    pub fn save_async(
        &self,
        kind: Kind,
        file: &'static str,
        bytes: Vec<u8>,
    ) -> Result<(), SaveError> {
        let Some(queue) = &self.queue else {
            return Err(SaveError::Backpressure);
        };
        queue
            .try_send(Job { kind, file, bytes })
            .map_err(|_| SaveError::Backpressure)
    }

    /// preferred write: async when available, falling back to the sync
    /// path on backpressure or while the queue is suspended
    pub fn store(&self, kind: Kind, file: &'static str, bytes: Vec<u8>) -> Result<(), SaveError> {
        if self.suspended.load(Ordering::SeqCst) {
            return self.save(kind, file, &bytes);
        }
        let Some(queue) = &self.queue else {
            return self.save(kind, file, &bytes);
        };
        match queue.try_send(Job { kind, file, bytes }) {
            Ok(()) => Ok(()),
            Err(crossbeam_channel::TrySendError::Full(job))
            | Err(crossbeam_channel::TrySendError::Disconnected(job)) => {
                log::debug!("backpressure on {}; saving synchronously", job.file);
                self.save(job.kind, job.file, &job.bytes)
            }
        }
    }

    /// queued async saves are discarded from now on; in-flight renames
    /// complete untouched
    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
    }
    pub fn resume(&self) {
        self.suspended.store(false, Ordering::SeqCst);
    }

    /// read and validate a checkpoint body. corrupt files are renamed
    /// aside to `<file>.corrupt.<epoch>` so the learner starts fresh.
    pub fn load(&self, kind: Kind, file: &str) -> Result<Vec<u8>, SaveError> {
        let path = self.dir.join(file);
        if !path.exists() {
            return Err(SaveError::Missing);
        }
        let raw = std::fs::read(&path)?;
        let plain = match compressed(&path) {
            false => raw,
            true => {
                let mut out = Vec::new();
                match flate2::read::GzDecoder::new(raw.as_slice()).read_to_end(&mut out) {
                    Ok(_) => out,
                    Err(_) => return Err(self.quarantine(&path)),
                }
            }
        };
        let ref mut reader = plain.as_slice();
        let header = match Header::read(reader) {
            Ok(header) => header,
            Err(SaveError::Incompatible { expected, found }) => {
                return Err(SaveError::Incompatible { expected, found });
            }
            Err(_) => return Err(self.quarantine(&path)),
        };
        if header.kind != kind {
            return Err(self.quarantine(&path));
        }
        Ok(reader.to_vec())
    }

    /// a deserialization failure discovered after the header also
    /// quarantines the file
    pub fn condemn(&self, file: &str) -> SaveError {
        self.quarantine(&self.dir.join(file))
    }

    fn quarantine(&self, path: &Path) -> SaveError {
        let aside = PathBuf::from(format!(
            "{}.corrupt.{}",
            path.to_string_lossy(),
            crate::epoch()
        ));
        match std::fs::rename(path, &aside) {
            Ok(()) => log::warn!("quarantined corrupt checkpoint at {}", aside.display()),
            Err(e) => log::error!("failed to quarantine {}: {}", path.display(), e),
        }
        SaveError::Corrupt(aside)
    }

    /// drop the queue and join the io worker
    pub fn shutdown(&mut self) {
        self.queue = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Vault {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn compressed(path: &Path) -> bool {
    let name = path.to_string_lossy();
    name.ends_with(".gz") || name.ends_with(".zip")
}

/// serialize header + body to `<path>.tmp.<pid>.<nonce>`, fsync, then
/// atomically rename over the target. retried with backoff.
fn write_atomic(path: &Path, kind: Kind, bytes: &[u8], nonce: &AtomicU64) -> std::io::Result<()> {
    let mut plain = Vec::with_capacity(bytes.len() + 8);
    Header::new(kind).write(&mut plain)?;
    plain.extend_from_slice(bytes);
    let payload = match compressed(path) {
        false => plain,
        true => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(&plain)?;
            encoder.finish()?
        }
    };
    let mut error = None;
    for attempt in 0..SAVE_RETRIES {
        let scratch = PathBuf::from(format!(
            "{}.tmp.{}.{}",
            path.to_string_lossy(),
            std::process::id(),
            nonce.fetch_add(1, Ordering::Relaxed),
        ));
        match try_write(&scratch, path, &payload) {
            Ok(()) => return Ok(()),
            Err(e) => {
                let _ = std::fs::remove_file(&scratch);
                log::warn!("checkpoint write attempt {} failed: {}", attempt + 1, e);
                error = Some(e);
                std::thread::sleep(std::time::Duration::from_millis(
                    SAVE_BACKOFF_MILLIS << attempt,
                ));
            }
        }
    }
    Err(error.expect("retries implies failure"))
}

fn try_write(scratch: &Path, path: &Path, payload: &[u8]) -> std::io::Result<()> {
    let mut file = std::fs::File::create(scratch)?;
    file.write_all(payload)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(scratch, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault(async_io: bool) -> (tempfile::TempDir, Vault) {
        let dir = tempfile::tempdir().expect("tempdir");
        let vault = Vault::new(dir.path(), async_io).expect("vault");
        (dir, vault)
    }

    #[test]
    fn is_load_inverse_save() {
        let (_dir, vault) = vault(false);
        let body = b"opaque learner bytes".to_vec();
        vault.save(Kind::QTable, "qtable.dat", &body).expect("save");
        let loaded = vault.load(Kind::QTable, "qtable.dat").expect("load");
        assert!(loaded == body);
    }

    #[test]
    fn compressed_suffix_roundtrips() {
        let (_dir, vault) = vault(false);
        let body = vec![7u8; 4096];
        vault.save(Kind::Value, "value_model.zip", &body).expect("save");
        let loaded = vault.load(Kind::Value, "value_model.zip").expect("load");
        assert!(loaded == body);
        // deflate actually ran on the repetitive payload
        let on_disk = std::fs::metadata(vault.path("value_model.zip")).expect("stat");
        assert!((on_disk.len() as usize) < body.len());
    }

    #[test]
    fn no_scratch_files_survive_a_save() {
        let (dir, vault) = vault(false);
        vault.save(Kind::QTable, "qtable.dat", b"x").expect("save");
        let leftovers = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .count();
        assert!(leftovers == 0);
    }

    #[test]
    fn corrupt_file_is_quarantined() {
        let (dir, vault) = vault(false);
        std::fs::write(vault.path("qtable.dat"), b"random garbage bytes").expect("write");
        let result = vault.load(Kind::QTable, "qtable.dat");
        assert!(matches!(result, Err(SaveError::Corrupt(_))));
        assert!(!vault.path("qtable.dat").exists());
        let quarantined = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".corrupt."))
            .count();
        assert!(quarantined == 1);
    }

    #[test]
    fn wrong_kind_is_quarantined() {
        let (_dir, vault) = vault(false);
        vault.save(Kind::Dqn, "qtable.dat", b"body").expect("save");
        assert!(matches!(
            vault.load(Kind::QTable, "qtable.dat"),
            Err(SaveError::Corrupt(_))
        ));
    }

    #[test]
    fn missing_file_is_missing() {
        let (_dir, vault) = vault(false);
        assert!(matches!(
            vault.load(Kind::QTable, "qtable.dat"),
            Err(SaveError::Missing)
        ));
    }

    #[test]
    fn async_path_lands_eventually() {
        let (_dir, mut vault) = vault(true);
        vault
            .save_async(Kind::QTable, "qtable.dat", b"async body".to_vec())
            .expect("enqueue");
        vault.shutdown();
        let loaded = vault.load(Kind::QTable, "qtable.dat").expect("load");
        assert!(loaded == b"async body".to_vec());
    }

    #[test]
    fn suspended_queue_discards_jobs() {
        let (_dir, mut vault) = vault(true);
        vault.suspend();
        vault
            .save_async(Kind::QTable, "qtable.dat", b"late".to_vec())
            .expect("enqueue");
        vault.shutdown();
        assert!(matches!(
            vault.load(Kind::QTable, "qtable.dat"),
            Err(SaveError::Missing)
        ));
    }
}
