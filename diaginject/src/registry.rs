//! Worker registry.
//!
//! Tracks the injection running for each pod, enforces the worker cap, and
//! remembers whether each pod's latest run succeeded. A single mutex covers
//! both tables and is never held across an `.await`.

use crate::pipe::PipeHandle;
use diaginject_shared::{PodKey, StatusResponse};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Run-time handle for one in-flight injection.
#[derive(Debug)]
pub struct Worker {
    key: PodKey,
    generation: u64,
    cancel: CancellationToken,
    pipe: PipeHandle,
}

impl Worker {
    pub fn new(key: PodKey, generation: u64, cancel: CancellationToken, pipe: PipeHandle) -> Self {
        Self {
            key,
            generation,
            cancel,
            pipe,
        }
    }

    pub fn key(&self) -> &PodKey {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Cancel both exec calls, then close the writer and the reader.
    ///
    /// Safe to call any number of times, including after the job finished.
    pub fn abort(&self) {
        self.cancel.cancel();
        self.pipe.close_writer();
        self.pipe.close_reader();
    }
}

/// Outcome of [`WorkerRegistry::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Slot reserved under this generation.
    Accepted(u64),
    /// A worker already exists for the pod.
    AlreadyPresent,
    /// The worker cap is reached.
    Saturated,
}

/// Reserved slot; the worker arrives once the job has launched.
struct Slot {
    name: String,
    generation: u64,
    worker: Option<Worker>,
}

/// Latest known result for a pod.
#[derive(Debug, Clone)]
struct Completion {
    generation: u64,
    succeeded: bool,
    artifact_path: Option<String>,
}

#[derive(Default)]
struct Inner {
    slots: Vec<Slot>,
    completions: HashMap<String, Completion>,
    next_generation: u64,
}

impl Inner {
    fn position(&self, name: &str) -> Option<usize> {
        self.slots.iter().position(|slot| slot.name == name)
    }
}

/// Registry of active workers, keyed by pod name.
///
/// Cheap to clone; clones share the same tables.
#[derive(Clone)]
pub struct WorkerRegistry {
    inner: Arc<Mutex<Inner>>,
    max_workers: usize,
}

impl WorkerRegistry {
    /// Create a registry admitting at most `max_workers` (at least one).
    pub fn new(max_workers: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            max_workers: max_workers.max(1),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Check if a worker exists for the pod.
    pub fn has(&self, name: &str) -> bool {
        self.inner.lock().position(name).is_some()
    }

    /// Number of live workers (reserved slots included).
    pub fn live_count(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Reserve a slot for the pod and reset its completion record.
    pub fn admit(&self, name: &str) -> Admission {
        let mut inner = self.inner.lock();
        if inner.position(name).is_some() {
            return Admission::AlreadyPresent;
        }
        if inner.slots.len() >= self.max_workers {
            return Admission::Saturated;
        }

        inner.next_generation += 1;
        let generation = inner.next_generation;
        inner.slots.push(Slot {
            name: name.to_string(),
            generation,
            worker: None,
        });
        inner.completions.insert(
            name.to_string(),
            Completion {
                generation,
                succeeded: false,
                artifact_path: None,
            },
        );
        debug!(pod = name, generation, "worker admitted");
        Admission::Accepted(generation)
    }

    /// Store the worker in the slot reserved for `generation`.
    ///
    /// Returns `false` if that slot is gone (stopped or already completed);
    /// the worker is handed back so the caller can abort it.
    pub fn attach(&self, name: &str, generation: u64, worker: Worker) -> Result<(), Worker> {
        let mut inner = self.inner.lock();
        match inner
            .slots
            .iter_mut()
            .find(|slot| slot.name == name && slot.generation == generation)
        {
            Some(slot) => {
                slot.worker = Some(worker);
                Ok(())
            }
            None => Err(worker),
        }
    }

    /// Abort and drop the pod's worker. Idempotent.
    ///
    /// Returns `true` if a slot was removed.
    pub fn remove(&self, name: &str) -> bool {
        let slot = {
            let mut inner = self.inner.lock();
            match inner.position(name) {
                Some(idx) => inner.slots.remove(idx),
                None => return false,
            }
        };

        match slot.worker {
            Some(worker) => {
                worker.abort();
                debug!(pod = %worker.key(), generation = worker.generation(), "worker removed");
            }
            None => debug!(pod = name, generation = slot.generation, "reserved slot removed"),
        }
        true
    }

    /// Record whether the pod's latest run succeeded.
    pub fn mark_done(&self, name: &str, ok: bool) {
        let mut inner = self.inner.lock();
        let generation = inner.next_generation;
        inner
            .completions
            .entry(name.to_string())
            .and_modify(|c| c.succeeded = ok)
            .or_insert(Completion {
                generation,
                succeeded: ok,
                artifact_path: None,
            });
    }

    /// Completion path of a job: remove its slot, then record the result.
    ///
    /// Both steps only apply to `generation`, so a late callback from a
    /// stopped job cannot touch a newer job for the same pod. Returns `true`
    /// if the result was recorded.
    pub fn complete(
        &self,
        name: &str,
        generation: u64,
        ok: bool,
        artifact_path: Option<String>,
    ) -> bool {
        let mut inner = self.inner.lock();

        if let Some(idx) = inner
            .slots
            .iter()
            .position(|slot| slot.name == name && slot.generation == generation)
        {
            let slot = inner.slots.remove(idx);
            if let Some(worker) = slot.worker {
                worker.abort();
            }
        }

        match inner.completions.get_mut(name) {
            Some(completion) if completion.generation == generation => {
                completion.succeeded = ok;
                completion.artifact_path = artifact_path;
                true
            }
            _ => false,
        }
    }

    /// Reply to a `status` request for the pod.
    pub fn status(&self, name: &str) -> StatusResponse {
        let inner = self.inner.lock();
        if inner.position(name).is_some() {
            return StatusResponse::Writing;
        }
        match inner.completions.get(name) {
            Some(completion) if completion.succeeded => StatusResponse::Done,
            _ => StatusResponse::Idle,
        }
    }

    /// Artifact path recorded by the pod's latest successful run.
    pub fn artifact_path(&self, name: &str) -> Option<String> {
        let inner = self.inner.lock();
        inner
            .completions
            .get(name)
            .filter(|c| c.succeeded)
            .and_then(|c| c.artifact_path.clone())
    }

    /// Abort and drop every worker. Returns how many slots were cleared.
    pub fn cancel_all(&self) -> usize {
        let slots = std::mem::take(&mut self.inner.lock().slots);
        let count = slots.len();
        for slot in slots {
            if let Some(worker) = slot.worker {
                worker.abort();
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::byte_pipe;

    fn worker(name: &str, generation: u64) -> (Worker, CancellationToken, PipeHandle) {
        let cancel = CancellationToken::new();
        let (_r, _w, pipe) = byte_pipe(8);
        let worker = Worker::new(
            PodKey::new(name, "ns"),
            generation,
            cancel.clone(),
            pipe.clone(),
        );
        (worker, cancel, pipe)
    }

    fn accepted(admission: Admission) -> u64 {
        match admission {
            Admission::Accepted(generation) => generation,
            other => panic!("expected admission, got {:?}", other),
        }
    }

    #[test]
    fn test_admit_respects_cap_and_duplicates() {
        let registry = WorkerRegistry::new(1);
        accepted(registry.admit("podA"));
        assert_eq!(registry.admit("podA"), Admission::AlreadyPresent);
        assert_eq!(registry.admit("podB"), Admission::Saturated);
        assert_eq!(registry.live_count(), 1);
        assert!(registry.has("podA"));
        assert!(!registry.has("podB"));
    }

    #[test]
    fn test_zero_cap_is_raised_to_one() {
        let registry = WorkerRegistry::new(0);
        assert_eq!(registry.max_workers(), 1);
        accepted(registry.admit("p"));
    }

    #[test]
    fn test_status_transitions() {
        let registry = WorkerRegistry::new(2);
        assert_eq!(registry.status("podA"), StatusResponse::Idle);

        let generation = accepted(registry.admit("podA"));
        assert_eq!(registry.status("podA"), StatusResponse::Writing);

        assert!(registry.complete("podA", generation, true, Some("/serviceability/a.tar.gz".into())));
        assert_eq!(registry.status("podA"), StatusResponse::Done);
        assert_eq!(
            registry.artifact_path("podA").as_deref(),
            Some("/serviceability/a.tar.gz")
        );

        let generation = accepted(registry.admit("podA"));
        assert_eq!(registry.artifact_path("podA"), None);
        assert!(registry.complete("podA", generation, false, None));
        assert_eq!(registry.status("podA"), StatusResponse::Idle);
    }

    #[test]
    fn test_remove_aborts_worker_and_is_idempotent() {
        let registry = WorkerRegistry::new(1);
        let generation = accepted(registry.admit("podA"));
        let (worker, cancel, pipe) = worker("podA", generation);
        registry.attach("podA", generation, worker).unwrap();

        assert!(registry.remove("podA"));
        assert!(cancel.is_cancelled());
        assert!(pipe.is_closed());
        assert!(!registry.remove("podA"));
        assert_eq!(registry.status("podA"), StatusResponse::Idle);
    }

    #[test]
    fn test_attach_after_removal_hands_worker_back() {
        let registry = WorkerRegistry::new(1);
        let generation = accepted(registry.admit("podA"));
        registry.remove("podA");

        let (worker, _cancel, _pipe) = worker("podA", generation);
        let returned = registry.attach("podA", generation, worker).unwrap_err();
        assert_eq!(returned.generation(), generation);
        assert_eq!(returned.key(), &PodKey::new("podA", "ns"));
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_stale_completion_cannot_touch_newer_job() {
        let registry = WorkerRegistry::new(1);
        let first = accepted(registry.admit("podA"));
        registry.remove("podA");
        let second = accepted(registry.admit("podA"));

        // Late callback from the stopped job.
        assert!(!registry.complete("podA", first, true, None));
        assert!(registry.has("podA"));
        assert_eq!(registry.status("podA"), StatusResponse::Writing);

        assert!(registry.complete("podA", second, true, None));
        assert_eq!(registry.status("podA"), StatusResponse::Done);
    }

    #[test]
    fn test_mark_done_records_result() {
        let registry = WorkerRegistry::new(1);
        registry.mark_done("podA", true);
        assert_eq!(registry.status("podA"), StatusResponse::Done);
        registry.mark_done("podA", false);
        assert_eq!(registry.status("podA"), StatusResponse::Idle);
    }

    #[test]
    fn test_cancel_all_clears_every_slot() {
        let registry = WorkerRegistry::new(3);
        let mut cancels = Vec::new();
        for name in ["a", "b"] {
            let generation = accepted(registry.admit(name));
            let (worker, cancel, _pipe) = worker(name, generation);
            registry.attach(name, generation, worker).unwrap();
            cancels.push(cancel);
        }
        accepted(registry.admit("c"));

        assert_eq!(registry.cancel_all(), 3);
        assert_eq!(registry.live_count(), 0);
        assert!(cancels.iter().all(|c| c.is_cancelled()));
    }

    #[test]
    fn test_cap_is_never_exceeded_under_contention() {
        let registry = WorkerRegistry::new(2);
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.admit(&format!("pod-{}", i % 4)))
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|a| matches!(a, Admission::Accepted(_)))
            .count();
        assert_eq!(admitted, 2);
        assert_eq!(registry.live_count(), 2);
    }
}
