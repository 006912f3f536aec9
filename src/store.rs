use chrono::Local;
use fs2::FileExt;
use serde_json::{Map, Value};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::models::{normalize_url, JobRecord, JobStatus, Statistics};

const MAX_LOCK_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Total attempts to take the file lock before giving up.
    pub lock_retries: u32,
    /// First backoff step; doubles on each failed attempt.
    pub lock_backoff: Duration,
    /// Copy the current file aside before every save.
    pub backup_enabled: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            lock_retries: 10,
            lock_backoff: Duration::from_millis(50),
            backup_enabled: false,
        }
    }
}

/// JSON-file job store shared by every session of a run, and by any other
/// process pointed at the same file.
///
/// Reads are served from an in-memory mirror. Every mutation takes an
/// exclusive advisory lock on `<file>.lock`, re-reads the file, applies the
/// change, fsyncs the new contents and only then releases the lock.
///
/// Writers inside the process queue on `writer`; the mirror lock is only
/// taken to swap in the result, so readers never wait on file I/O.
pub struct JobStore {
    path: PathBuf,
    lock_path: PathBuf,
    options: StoreOptions,
    writer: Mutex<()>,
    jobs: Mutex<Vec<JobRecord>>,
}

impl JobStore {
    pub fn open(path: impl Into<PathBuf>, options: StoreOptions) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
            }
        }

        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(".lock");

        let store = Self {
            lock_path: PathBuf::from(lock_name),
            path,
            options,
            writer: Mutex::new(()),
            jobs: Mutex::new(Vec::new()),
        };

        // Loading may migrate the file, so it happens under the lock too.
        let loaded = store.with_file_lock(|| store.read_file())?;
        info!(path = %store.path.display(), jobs = loaded.len(), "Job store opened");
        *store.mirror() = loaded;

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn mirror(&self) -> MutexGuard<'_, Vec<JobRecord>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn exclusive(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // --- Mutations ---

    /// Adds a job in `found` status, or returns the index of the record it
    /// duplicates. Duplicates are matched by normalized URL first, then by
    /// the case-insensitive (company, title) pair.
    pub fn add(
        &self,
        company: &str,
        job_title: &str,
        location: &str,
        job_url: &str,
        salary_range: &str,
        source: &str,
    ) -> Result<usize, StoreError> {
        self.mutate(|jobs| {
            if let Some(existing) = find_duplicate(jobs, company, job_title, job_url) {
                info!(index = existing, company, job_title, "Job already tracked");
                return (existing, false);
            }

            jobs.push(JobRecord::new(
                company,
                job_title,
                location,
                job_url,
                salary_range,
                source,
            ));
            let index = jobs.len() - 1;
            info!(index, company, job_title, location, source, "Job found");
            (index, true)
        })
    }

    /// Moves a job to `status`. Returns `false` without writing when the
    /// index is out of range or the transition would go backwards.
    pub fn update_status(
        &self,
        index: usize,
        status: JobStatus,
        note: &str,
    ) -> Result<bool, StoreError> {
        self.mutate(|jobs| {
            let Some(job) = jobs.get_mut(index) else {
                error!(index, total = jobs.len(), "Job index out of range");
                return (false, false);
            };

            let old = job.status;
            if !old.can_transition_to(status) {
                warn!(index, from = %old, to = %status, "Refusing backward status transition");
                return (false, false);
            }

            job.status = status;
            job.last_updated = Local::now();

            if status == JobStatus::Applied {
                info!(index, company = %job.company, job_title = %job.job_title, "Job applied");
            }
            info!(index, from = %old, to = %status, "Updated job status");
            if !note.is_empty() {
                info!(index, note, "Status note");
            }
            (true, true)
        })
    }

    /// Records a submitted application: merges `proof` into the job's
    /// `additional_info` and moves it to `applied`, as one locked write.
    /// Returns `false` without writing when the index is out of range or the
    /// job was already applied, by this process or another one.
    pub fn mark_applied(
        &self,
        index: usize,
        proof: Map<String, Value>,
        note: &str,
    ) -> Result<bool, StoreError> {
        self.mutate(|jobs| {
            let Some(job) = jobs.get_mut(index) else {
                error!(index, total = jobs.len(), "Job index out of range");
                return (false, false);
            };
            if job.status == JobStatus::Applied {
                warn!(index, company = %job.company, job_title = %job.job_title, "Job already applied, keeping first application");
                return (false, false);
            }

            let old = job.status;
            job.additional_info.extend(proof);
            job.status = JobStatus::Applied;
            job.last_updated = Local::now();
            info!(index, company = %job.company, job_title = %job.job_title, "Job applied");
            info!(index, from = %old, to = %JobStatus::Applied, "Updated job status");
            if !note.is_empty() {
                info!(index, note, "Status note");
            }
            (true, true)
        })
    }

    /// Merges `info` into the job's `additional_info`, overwriting keys that
    /// already exist.
    pub fn merge_additional_info(
        &self,
        index: usize,
        info: Map<String, Value>,
    ) -> Result<bool, StoreError> {
        self.mutate(|jobs| {
            let Some(job) = jobs.get_mut(index) else {
                error!(index, total = jobs.len(), "Job index out of range");
                return (false, false);
            };
            if info.is_empty() {
                return (true, false);
            }
            job.additional_info.extend(info);
            job.last_updated = Local::now();
            debug!(index, "Merged additional info");
            (true, true)
        })
    }

    /// Refreshes the in-memory mirror from disk.
    pub fn reload(&self) -> Result<usize, StoreError> {
        let _writer = self.exclusive();
        let jobs = self.with_file_lock(|| self.read_file())?;
        let count = jobs.len();
        *self.mirror() = jobs;
        debug!(jobs = count, "Reloaded job store");
        Ok(count)
    }

    fn mutate<T>(
        &self,
        apply: impl FnOnce(&mut Vec<JobRecord>) -> (T, bool),
    ) -> Result<T, StoreError> {
        // The writer mutex serializes writers inside this process; the file
        // lock serializes them across processes.
        let _writer = self.exclusive();
        let (out, jobs) = self.with_file_lock(|| {
            let mut jobs = self.read_file()?;
            let (out, dirty) = apply(&mut jobs);
            if dirty {
                self.write_file(&jobs)?;
            }
            Ok((out, jobs))
        })?;
        *self.mirror() = jobs;
        Ok(out)
    }

    // --- Queries ---

    pub fn len(&self) -> usize {
        self.mirror().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mirror().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<JobRecord> {
        self.mirror().get(index).cloned()
    }

    pub fn all(&self) -> Vec<(usize, JobRecord)> {
        self.filtered(|_| true)
    }

    pub fn by_status(&self, status: JobStatus) -> Vec<(usize, JobRecord)> {
        self.filtered(|job| job.status == status)
    }

    pub fn by_company(&self, company: &str) -> Vec<(usize, JobRecord)> {
        let needle = company.to_lowercase();
        self.filtered(|job| job.company.to_lowercase().contains(&needle))
    }

    /// Case-insensitive substring search over title, company and location.
    pub fn search(&self, query: &str) -> Vec<(usize, JobRecord)> {
        let needle = query.to_lowercase();
        self.filtered(|job| {
            job.job_title.to_lowercase().contains(&needle)
                || job.company.to_lowercase().contains(&needle)
                || job.location.to_lowercase().contains(&needle)
        })
    }

    fn filtered(&self, keep: impl Fn(&JobRecord) -> bool) -> Vec<(usize, JobRecord)> {
        self.mirror()
            .iter()
            .enumerate()
            .filter(|(_, job)| keep(job))
            .map(|(i, job)| (i, job.clone()))
            .collect()
    }

    pub fn statistics(&self) -> Statistics {
        let jobs = self.mirror();
        let mut stats = Statistics {
            total_jobs: jobs.len(),
            ..Default::default()
        };

        for job in jobs.iter() {
            *stats
                .by_status
                .entry(job.status.as_str().to_string())
                .or_default() += 1;
            *stats.by_company.entry(or_unknown(&job.company)).or_default() += 1;
            *stats.by_job_board.entry(or_unknown(&job.job_board)).or_default() += 1;
            if job.status == JobStatus::Applied {
                stats.applied_count += 1;
            }
        }

        stats
    }

    // --- File handling ---

    fn with_file_lock<T>(
        &self,
        critical: impl FnOnce() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| StoreError::io(&self.lock_path, e))?;

        let attempts = self.options.lock_retries.max(1);
        let mut backoff = self.options.lock_backoff;
        let mut acquired = false;

        for attempt in 1..=attempts {
            if lock_file.try_lock_exclusive().is_ok() {
                acquired = true;
                break;
            }
            if attempt < attempts {
                debug!(attempt, backoff_ms = backoff.as_millis() as u64, "Job store locked, backing off");
                thread::sleep(backoff);
                backoff = (backoff * 2).min(MAX_LOCK_BACKOFF);
            }
        }

        if !acquired {
            return Err(StoreError::LockExhausted {
                path: self.lock_path.clone(),
                attempts,
            });
        }

        let result = critical();
        let unlocked = lock_file
            .unlock()
            .map_err(|e| StoreError::io(&self.lock_path, e));
        let value = result?;
        unlocked?;
        Ok(value)
    }

    fn read_file(&self) -> Result<Vec<JobRecord>, StoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };

        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }

        match parse_jobs(&raw) {
            Ok(StoredJobs::List(jobs)) => {
                debug!(jobs = jobs.len(), path = %self.path.display(), "Loaded jobs");
                Ok(jobs)
            }
            Ok(StoredJobs::Legacy(jobs)) => {
                info!(jobs = jobs.len(), "Migrating job store from keyed map to list");
                self.write_file(&jobs)?;
                Ok(jobs)
            }
            Ok(StoredJobs::Unrecognized) => {
                warn!(path = %self.path.display(), "Unrecognized job store shape, backing it up and starting empty");
                self.create_backup();
                Ok(Vec::new())
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Job store is unreadable, backing it up and starting empty");
                self.create_backup();
                Ok(Vec::new())
            }
        }
    }

    fn write_file(&self, jobs: &[JobRecord]) -> Result<(), StoreError> {
        if self.options.backup_enabled && self.path.exists() {
            self.create_backup();
        }

        let data = serde_json::to_string_pretty(jobs)?;

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        let mut file = File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
        file.write_all(data.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| StoreError::io(&tmp, e))?;
        drop(file);

        fs::rename(&tmp, &self.path).map_err(|e| StoreError::io(&self.path, e))?;
        debug!(jobs = jobs.len(), path = %self.path.display(), "Saved jobs");
        Ok(())
    }

    fn create_backup(&self) -> Option<PathBuf> {
        if !self.path.exists() {
            return None;
        }

        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "jobs".to_string());
        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        let backup = self
            .path
            .with_file_name(format!("{}_backup_{}.json", stem, timestamp));

        match fs::copy(&self.path, &backup) {
            Ok(_) => {
                debug!(backup = %backup.display(), "Created backup");
                Some(backup)
            }
            Err(e) => {
                warn!(error = %e, "Failed to create backup");
                None
            }
        }
    }
}

enum StoredJobs {
    List(Vec<JobRecord>),
    Legacy(Vec<JobRecord>),
    Unrecognized,
}

fn parse_jobs(raw: &str) -> Result<StoredJobs, serde_json::Error> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Array(items) => {
            let jobs = items
                .into_iter()
                .map(serde_json::from_value)
                .collect::<Result<Vec<JobRecord>, _>>()?;
            Ok(StoredJobs::List(jobs))
        }
        // The keyed shape maps generated ids to records; keep file order.
        Value::Object(map) => {
            let jobs = map
                .into_iter()
                .map(|(_, v)| serde_json::from_value(v))
                .collect::<Result<Vec<JobRecord>, _>>()?;
            Ok(StoredJobs::Legacy(jobs))
        }
        _ => Ok(StoredJobs::Unrecognized),
    }
}

fn find_duplicate(jobs: &[JobRecord], company: &str, job_title: &str, job_url: &str) -> Option<usize> {
    if let Some(url) = normalize_url(job_url) {
        if let Some(i) = jobs
            .iter()
            .position(|job| job.normalized_url().as_deref() == Some(url.as_str()))
        {
            return Some(i);
        }
    }

    jobs.iter().position(|job| job.same_position(company, job_title))
}

fn or_unknown(value: &str) -> String {
    if value.trim().is_empty() {
        "unknown".to_string()
    } else {
        value.to_string()
    }
}
