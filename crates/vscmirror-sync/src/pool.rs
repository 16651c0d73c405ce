use crate::resolver::WorkItem;
use sha2::{Digest, Sha256};
use std::collections::{HashSet, VecDeque};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use vscmirror_store::{satisfies, StoreLayout, WriteHandle};
use vscmirror_upstream::{RetryPolicy, UpstreamError, UpstreamSource};

const CHUNK: usize = 64 * 1024;

/// Live counters the CLI renders while a pool run is in flight.
#[derive(Debug, Default)]
pub struct Progress {
    total: AtomicUsize,
    done: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
    bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub done: usize,
    pub failed: usize,
    pub skipped: usize,
    pub bytes: u64,
}

impl Progress {
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total.load(Ordering::Relaxed),
            done: self.done.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }

    fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct JobFailure {
    pub identity: String,
    pub group: String,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct PoolReport {
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub bytes: u64,
    pub failures: Vec<JobFailure>,
    pub failed_groups: HashSet<String>,
}

impl PoolReport {
    /// A group is publishable only when none of its jobs failed.
    pub fn group_complete(&self, group: &str) -> bool {
        !self.failed_groups.contains(group)
    }
}

enum JobOutcome {
    Downloaded(u64),
    Skipped,
}

enum JobError {
    /// Worth another attempt: transport trouble or a verification mismatch.
    Retryable(String),
    /// Definitive: 4xx, store refusal, bad destination.
    Fatal(String),
    Cancelled,
}

/// Bounded-concurrency download executor: a fixed set of worker threads
/// drains the job queue, each job streaming into a temporary and committing
/// only after its declared size and hash check out.
pub struct DownloadPool {
    width: usize,
    retry: RetryPolicy,
}

impl DownloadPool {
    pub fn new(width: usize, retry: RetryPolicy) -> Self {
        Self {
            width: width.max(1),
            retry,
        }
    }

    pub fn run(
        &self,
        upstream: &dyn UpstreamSource,
        layout: &StoreLayout,
        jobs: Vec<WorkItem>,
        cancel: &(dyn Fn() -> bool + Sync),
        progress: &Progress,
    ) -> PoolReport {
        progress.total.store(jobs.len(), Ordering::Relaxed);
        let queue = Mutex::new(VecDeque::from(jobs));
        let report = Mutex::new(PoolReport::default());

        std::thread::scope(|scope| {
            for _ in 0..self.width {
                scope.spawn(|| loop {
                    if cancel() {
                        // Drain the queue so remaining jobs are accounted for.
                        let mut q = queue.lock().expect("queue lock poisoned");
                        while let Some(job) = q.pop_front() {
                            record_failure(&report, progress, &job, "cancelled");
                        }
                        break;
                    }
                    let job = {
                        let mut q = queue.lock().expect("queue lock poisoned");
                        q.pop_front()
                    };
                    let Some(job) = job else { break };

                    match self.run_job(upstream, layout, &job, cancel, progress) {
                        Ok(JobOutcome::Downloaded(bytes)) => {
                            progress.done.fetch_add(1, Ordering::Relaxed);
                            let mut r = report.lock().expect("report lock poisoned");
                            r.downloaded += 1;
                            r.bytes += bytes;
                        }
                        Ok(JobOutcome::Skipped) => {
                            progress.skipped.fetch_add(1, Ordering::Relaxed);
                            report.lock().expect("report lock poisoned").skipped += 1;
                        }
                        Err(JobError::Cancelled) => {
                            record_failure(&report, progress, &job, "cancelled");
                        }
                        Err(JobError::Retryable(e) | JobError::Fatal(e)) => {
                            tracing::warn!("{}: {e}", job.identity);
                            record_failure(&report, progress, &job, &e);
                        }
                    }
                });
            }
        });

        report.into_inner().expect("report lock poisoned")
    }

    fn run_job(
        &self,
        upstream: &dyn UpstreamSource,
        layout: &StoreLayout,
        job: &WorkItem,
        cancel: &(dyn Fn() -> bool + Sync),
        progress: &Progress,
    ) -> Result<JobOutcome, JobError> {
        let dest = layout
            .resolve(&job.relpath)
            .map_err(|e| JobError::Fatal(e.to_string()))?;

        if satisfies(&dest, job.expected_size, job.expected_sha256.as_deref()) {
            tracing::debug!("{} already satisfied", job.identity);
            return Ok(JobOutcome::Skipped);
        }

        let mut last_err = String::new();
        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                std::thread::sleep(self.retry.backoff(attempt - 1));
                tracing::debug!("{}: attempt {}", job.identity, attempt + 1);
            }
            if cancel() {
                return Err(JobError::Cancelled);
            }
            match self.attempt(upstream, job, &dest, cancel, progress) {
                Ok(bytes) => return Ok(JobOutcome::Downloaded(bytes)),
                Err(JobError::Retryable(e)) => last_err = e,
                Err(other) => return Err(other),
            }
        }
        Err(JobError::Retryable(last_err))
    }

    fn attempt(
        &self,
        upstream: &dyn UpstreamSource,
        job: &WorkItem,
        dest: &std::path::Path,
        cancel: &(dyn Fn() -> bool + Sync),
        progress: &Progress,
    ) -> Result<u64, JobError> {
        let mut body = upstream.fetch_asset(&job.url).map_err(|e| match e {
            UpstreamError::Status { status, .. } if status < 500 => JobError::Fatal(e.to_string()),
            other => JobError::Retryable(other.to_string()),
        })?;

        let mut handle =
            WriteHandle::create(dest).map_err(|e| JobError::Fatal(e.to_string()))?;
        let mut hasher = Sha256::new();
        let mut written = 0u64;
        let mut buf = vec![0u8; CHUNK];
        loop {
            if cancel() {
                handle.abort();
                return Err(JobError::Cancelled);
            }
            let n = match body.reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    handle.abort();
                    return Err(JobError::Retryable(format!("stream error: {e}")));
                }
            };
            if let Err(e) = handle.write_all(&buf[..n]) {
                handle.abort();
                return Err(JobError::Fatal(format!("write error: {e}")));
            }
            hasher.update(&buf[..n]);
            written += n as u64;
            progress.add_bytes(n as u64);
        }

        let declared = job.expected_size.or(body.declared_len);
        if let Some(expected) = declared {
            if written != expected {
                handle.abort();
                return Err(JobError::Retryable(format!(
                    "size mismatch: got {written}, expected {expected}"
                )));
            }
        }
        if let Some(ref expected) = job.expected_sha256 {
            let actual: String = hasher
                .finalize()
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect();
            if !actual.eq_ignore_ascii_case(expected) {
                handle.abort();
                return Err(JobError::Retryable(format!(
                    "sha256 mismatch: got {actual}, expected {expected}"
                )));
            }
        }

        handle.commit().map_err(|e| JobError::Fatal(e.to_string()))?;
        tracing::debug!("{}: committed {written} bytes", job.identity);
        Ok(written)
    }
}

fn record_failure(report: &Mutex<PoolReport>, progress: &Progress, job: &WorkItem, error: &str) {
    progress.failed.fetch_add(1, Ordering::Relaxed);
    let mut r = report.lock().expect("report lock poisoned");
    r.failed += 1;
    r.failed_groups.insert(job.group.clone());
    r.failures.push(JobFailure {
        identity: job.identity.clone(),
        group: job.group.clone(),
        error: error.to_owned(),
    });
}
