use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use common::{JobId, JobInfo, JobState};
use tokio::{sync::Semaphore, task::AbortHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::ExecutorError;
use crate::runner::{cancel_orphaned_array, JobFinalizer, JobRunner, RunnerContext};

struct InFlight {
    cancel: CancellationToken,
    abort: AbortHandle,
    finalizer: JobFinalizer,
}

type InFlightMap = Arc<Mutex<HashMap<JobId, InFlight>>>;

/// Pool acotado de jobs: como mucho `max_concurrent_jobs` corriendo, el
/// resto espera en QUEUED.
#[derive(Clone)]
pub struct JobExecutorService {
    ctx: Arc<RunnerContext>,
    permits: Arc<Semaphore>,
    in_flight: InFlightMap,
}

fn lock(map: &InFlightMap) -> MutexGuard<'_, HashMap<JobId, InFlight>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

impl JobExecutorService {
    pub fn new(ctx: Arc<RunnerContext>, max_concurrent_jobs: usize) -> Self {
        Self {
            ctx,
            permits: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn is_in_flight(&self, job_id: &str) -> bool {
        lock(&self.in_flight).contains_key(job_id)
    }

    /// Agenda un job ya registrado en el store. Un id que ya está en curso se rechaza.
    pub fn submit(&self, job: JobInfo) -> Result<(), ExecutorError> {
        let mut in_flight = lock(&self.in_flight);
        if in_flight.contains_key(&job.id) {
            return Err(ExecutorError::Duplicate(job.id));
        }

        let job_id = job.id.clone();
        let cancel = CancellationToken::new();
        let finalizer = JobFinalizer::new(&self.ctx, &job);
        self.ctx.logs.start(&job_id);

        let runner = JobRunner::new(self.ctx.clone(), job, cancel.clone(), finalizer.clone());
        let permits = self.permits.clone();
        let map = self.in_flight.clone();
        let waiting = cancel.clone();
        let id = job_id.clone();

        let handle = tokio::spawn(async move {
            // un job cancelado mientras espera no necesita lugar en el pool
            let _permit = tokio::select! {
                permit = permits.acquire_owned() => permit.ok(),
                _ = waiting.cancelled() => None,
            };
            let state = runner.run().await;
            lock(&map).remove(&id);
            state
        });

        info!(job_id = %job_id, "job encolado");
        in_flight.insert(
            job_id,
            InFlight {
                cancel,
                abort: handle.abort_handle(),
                finalizer,
            },
        );
        Ok(())
    }

    /// Pide la cancelación cooperativa; si el job sigue vivo pasado
    /// `abort_delay`, se aborta la tarea y se cierra como CANCELED.
    /// Devuelve false si el job no está en curso.
    pub fn cancel(&self, job_id: &str, abort_delay: Duration) -> bool {
        let in_flight = lock(&self.in_flight);
        let Some(job) = in_flight.get(job_id) else {
            return false;
        };
        info!(job_id, "cancelación solicitada");
        job.cancel.cancel();

        let abort = job.abort.clone();
        let finalizer = job.finalizer.clone();
        let map = self.in_flight.clone();
        let ctx = self.ctx.clone();
        let id = job_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(abort_delay).await;
            if abort.is_finished() || finalizer.is_finished() {
                return;
            }
            warn!(job_id = %id, delay = ?abort_delay, "el job no respondió a la cancelación, abortando");
            abort.abort();
            if finalizer.finish(JobState::Canceled) {
                info!(job_id = %id, "job cerrado por abort forzado");
            }
            lock(&map).remove(&id);
            // el runner abortado no llegó a cancelar su array
            cancel_orphaned_array(&ctx, &id).await;
        });
        true
    }

    /// Espera hasta que el job salga del pool. Devuelve false si pasó `timeout`.
    pub async fn wait_until_idle(&self, job_id: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.is_in_flight(job_id) {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::scripts;
    use crate::remote::fake::FakeCluster;
    use crate::runner::tests::{harness, queued_job, FakeCompute};
    use crate::store::JobStore;

    async fn wait_for_state(store: &dyn JobStore, job_id: &str, wanted: JobState) {
        for _ in 0..200 {
            if store.get_job(job_id).unwrap().state == wanted {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!(
            "el job {job_id} no llegó a {wanted}, quedó en {}",
            store.get_job(job_id).unwrap().state
        );
    }

    #[tokio::test]
    async fn id_duplicado_se_rechaza() {
        let h = harness(
            FakeCompute {
                hang_on: Some(scripts::IMPORT),
                ..Default::default()
            },
            None,
        );
        let executor = JobExecutorService::new(h.ctx.clone(), 2);
        let job = queued_job(&h, false);

        executor.submit(job.clone()).unwrap();
        let err = executor.submit(job.clone()).unwrap_err();
        assert!(matches!(err, ExecutorError::Duplicate(id) if id == job.id));

        executor.cancel(&job.id, Duration::from_secs(10));
        wait_for_state(h.store.as_ref(), &job.id, JobState::Canceled).await;
    }

    #[tokio::test]
    async fn job_completo_sale_del_pool() {
        let h = harness(FakeCompute::default(), None);
        let executor = JobExecutorService::new(h.ctx.clone(), 1);
        let job = queued_job(&h, false);

        executor.submit(job.clone()).unwrap();
        wait_for_state(h.store.as_ref(), &job.id, JobState::Completed).await;
        assert!(executor.wait_until_idle(&job.id, Duration::from_secs(1)).await);
        assert!(!executor.cancel(&job.id, Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn pool_acotado_deja_el_resto_en_cola() {
        let h = harness(
            FakeCompute {
                hang_on: Some(scripts::IMPORT),
                ..Default::default()
            },
            None,
        );
        let executor = JobExecutorService::new(h.ctx.clone(), 1);
        let first = queued_job(&h, false);
        let second = queued_job(&h, false);

        executor.submit(first.clone()).unwrap();
        wait_for_state(h.store.as_ref(), &first.id, JobState::Running).await;
        executor.submit(second.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.store.get_job(&second.id).unwrap().state, JobState::Queued);

        // cancelar el que espera no depende del pool
        executor.cancel(&second.id, Duration::from_secs(10));
        wait_for_state(h.store.as_ref(), &second.id, JobState::Canceled).await;

        executor.cancel(&first.id, Duration::from_secs(10));
        wait_for_state(h.store.as_ref(), &first.id, JobState::Canceled).await;
    }

    #[tokio::test]
    async fn job_que_ignora_la_cancelacion_se_aborta() {
        let h = harness(
            FakeCompute {
                stubborn_on: Some(scripts::IMPORT),
                ..Default::default()
            },
            None,
        );
        let executor = JobExecutorService::new(h.ctx.clone(), 1);
        let job = queued_job(&h, false);

        executor.submit(job.clone()).unwrap();
        wait_for_state(h.store.as_ref(), &job.id, JobState::Running).await;

        assert!(executor.cancel(&job.id, Duration::from_millis(50)));
        wait_for_state(h.store.as_ref(), &job.id, JobState::Canceled).await;

        let stored = h.store.get_job(&job.id).unwrap();
        assert_eq!(stored.progress_percent, 100.0);
        assert!(stored.end_time.is_some());
        assert!(executor.wait_until_idle(&job.id, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn abort_forzado_cancela_el_array_en_el_cluster() {
        let cluster = FakeCluster::new();
        cluster.set_submit_answer("Submitted batch job 91\n");
        cluster.hang_accounting();
        let h = harness(FakeCompute::default(), Some(cluster.clone()));
        let executor = JobExecutorService::new(h.ctx.clone(), 1);
        let job = queued_job(&h, true);

        executor.submit(job.clone()).unwrap();
        for _ in 0..200 {
            if h.store.get_job(&job.id).unwrap().remote_job_id.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(h.store.get_job(&job.id).unwrap().remote_job_id.as_deref(), Some("91"));

        // sacct no responde: el runner no ve la cancelación y se aborta
        assert!(executor.cancel(&job.id, Duration::from_millis(50)));
        wait_for_state(h.store.as_ref(), &job.id, JobState::Canceled).await;

        let scancel = || {
            cluster
                .commands()
                .iter()
                .any(|c| c.starts_with("scancel") && c.contains("91"))
        };
        for _ in 0..200 {
            if scancel() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(scancel());
    }
}
