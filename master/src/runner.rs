//! Ciclo de vida de un job: QUEUED → RUNNING → {COMPLETED | FAILED | CANCELED}.

use std::{
    collections::HashSet,
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use chrono::Utc;
use common::{
    merge::{merge_results, MergeReport, MergeSettings, ResultNaming},
    partition::{sort_heaviest_first, units_from_geojson, PARTITION_CONFIG_FILE},
    partition, JobId, JobInfo, JobState, PartitionConfig, PartitionError, JOB_LOG_FILE,
    RESULTS_DIR, RESULTS_POST_DIR,
};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::compute::{scripts, ComputeLibrary};
use crate::config::{ClusterConfig, MasterConfig};
use crate::error::{log_error_chain, JobError};
use crate::logging::JobLogRegistry;
use crate::progress::{ProgressReporter, StageProgress};
use crate::remote::{remote_join, RemoteConnector, RemoteExecutionDriver};
use crate::store::{DebouncedProgress, JobStore};

/// Etapas del pipeline; cada una vale un paso fijo de progreso.
pub const STAGES: [&str; 8] = [
    "prepare",
    "import",
    "receivers_grid",
    "emission",
    "partition",
    "compute",
    "merge",
    "export",
];

/// Todo lo que un job necesita del proceso: se arma una vez en `main`.
pub struct RunnerContext {
    pub store: Arc<dyn JobStore>,
    pub compute: Arc<dyn ComputeLibrary>,
    pub connector: Arc<dyn RemoteConnector>,
    pub config: Arc<MasterConfig>,
    pub merge_settings: MergeSettings,
    pub logs: JobLogRegistry,
}

/* ---------------- cierre del job ---------------- */

/// Cierra el job una sola vez: el runner y el abort forzado del executor
/// pueden intentarlo, gana el primero.
#[derive(Clone)]
pub struct JobFinalizer {
    job_id: JobId,
    working_dir: PathBuf,
    store: Arc<dyn JobStore>,
    logs: JobLogRegistry,
    finished: Arc<AtomicBool>,
}

impl JobFinalizer {
    pub fn new(ctx: &RunnerContext, job: &JobInfo) -> Self {
        Self {
            job_id: job.id.clone(),
            working_dir: PathBuf::from(&job.working_directory),
            store: ctx.store.clone(),
            logs: ctx.logs.clone(),
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Persiste el estado final, fin y progreso 100, y vuelca el log del job.
    /// Devuelve false si el job ya estaba cerrado.
    pub fn finish(&self, state: JobState) -> bool {
        if self.finished.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!(state = %state, "job terminado");

        if let Some(lines) = self.logs.take(&self.job_id) {
            if let Err(e) = self.write_job_log(&lines) {
                warn!(job_id = %self.job_id, error = %e, "no se pudo escribir el log del job");
            }
        }
        if let Err(e) = self.store.finish(&self.job_id, state) {
            error!(job_id = %self.job_id, error = %e, "no se pudo cerrar el job en el store");
        }
        true
    }

    fn write_job_log(&self, lines: &[String]) -> std::io::Result<()> {
        fs::create_dir_all(&self.working_dir)?;
        let mut text = lines.join("\n");
        text.push('\n');
        fs::write(self.working_dir.join(JOB_LOG_FILE), text)
    }
}

/* ---------------- runner ---------------- */

pub struct JobRunner {
    ctx: Arc<RunnerContext>,
    job: JobInfo,
    cancel: CancellationToken,
    finalizer: JobFinalizer,
}

impl JobRunner {
    pub fn new(
        ctx: Arc<RunnerContext>,
        job: JobInfo,
        cancel: CancellationToken,
        finalizer: JobFinalizer,
    ) -> Self {
        Self {
            ctx,
            job,
            cancel,
            finalizer,
        }
    }

    /// Corre el job completo dentro del span `job` y devuelve el estado final.
    pub async fn run(self) -> JobState {
        let span = info_span!("job", job_id = %self.job.id);
        self.run_in_span().instrument(span).await
    }

    async fn run_in_span(self) -> JobState {
        if self.cancel.is_cancelled() {
            info!("job cancelado antes de empezar");
            self.finalizer.finish(JobState::Canceled);
            return JobState::Canceled;
        }

        if let Err(e) = self.mark_running() {
            log_error_chain(&e);
            self.finalizer.finish(JobState::Failed);
            return JobState::Failed;
        }
        info!(
            name = %self.job.name,
            dataset = %self.job.request.dataset,
            cluster = self.job.request.compute_on_cluster,
            "job iniciado"
        );

        let state = match self.pipeline().await {
            Ok(_) if self.cancel.is_cancelled() => JobState::Canceled,
            Ok(report) => {
                info!(files = report.output_files().len(), "resultados listos");
                JobState::Completed
            }
            Err(JobError::Canceled) => {
                warn!("cancelación observada, se saltean las etapas restantes");
                JobState::Canceled
            }
            Err(e) => {
                log_error_chain(&e);
                JobState::Failed
            }
        };
        self.finalizer.finish(state);
        state
    }

    fn mark_running(&self) -> Result<(), JobError> {
        self.ctx.store.set_state(&self.job.id, JobState::Running)?;
        self.ctx.store.set_begin_time(&self.job.id, Utc::now())?;
        Ok(())
    }

    fn checkpoint(&self, stage: &str) -> Result<(), JobError> {
        if self.cancel.is_cancelled() {
            return Err(JobError::Canceled);
        }
        info!(stage, "etapa");
        Ok(())
    }

    fn working_dir(&self) -> PathBuf {
        PathBuf::from(&self.job.working_directory)
    }

    async fn pipeline(&self) -> Result<MergeReport, JobError> {
        let wd = self.working_dir();
        let sink: Arc<dyn ProgressReporter> = Arc::new(DebouncedProgress::new(
            self.ctx.store.clone(),
            self.job.id.clone(),
            self.ctx.config.progress_interval(),
        ));
        let progress = StageProgress::new(sink, STAGES.len());

        self.checkpoint("prepare")?;
        // lo que dejó una corrida anterior no debe pasar por resultado nuevo
        for dir in [wd.join(RESULTS_DIR), wd.join(RESULTS_POST_DIR)] {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => info!(dir = %dir.display(), "resultados previos eliminados"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(JobError::local_io(&dir, e)),
            }
        }
        for dir in [wd.clone(), wd.join(RESULTS_DIR), wd.join(RESULTS_POST_DIR)] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| JobError::local_io(&dir, e))?;
        }
        progress.stage_done();

        for (stage, script) in [
            ("import", scripts::IMPORT),
            ("receivers_grid", scripts::RECEIVERS_GRID),
            ("emission", scripts::EMISSION),
        ] {
            self.checkpoint(stage)?;
            self.run_script(script, self.base_params()).await?;
            progress.stage_done();
        }

        self.checkpoint("partition")?;
        let cluster = self.cluster_config()?;
        let max_partitions = cluster.as_ref().map_or(1, |c| c.max_jobs.max(1));
        let partitions = self.build_partitions(&wd, max_partitions).await?;
        progress.stage_done();

        self.checkpoint("compute")?;
        match cluster {
            Some(cluster) => {
                self.compute_on_cluster(cluster, &partitions, &wd, &progress)
                    .await?
            }
            None => self.compute_locally(&partitions, &progress).await?,
        }
        verify_partition_outputs(
            &wd.join(RESULTS_DIR),
            &self.ctx.merge_settings.naming,
            partitions.len(),
        )?;
        progress.stage_done();

        self.checkpoint("merge")?;
        let report = self.merge(&wd).await?;
        progress.stage_done();

        self.checkpoint("export")?;
        let mut params = self.base_params();
        let merged: Vec<String> = report
            .output_files()
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect();
        params.insert("mergedFiles".into(), json!(merged));
        self.run_script(scripts::EXPORT, params).await?;
        progress.stage_done();

        Ok(report)
    }

    /// `dataset`, `configurationId` y los parámetros extra de la petición.
    fn base_params(&self) -> Map<String, Value> {
        let request = &self.job.request;
        let mut params: Map<String, Value> = request
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        params.insert("dataset".into(), json!(request.dataset));
        params.insert("configurationId".into(), json!(request.configuration_id));
        params
    }

    async fn run_script(&self, script: &str, params: Map<String, Value>) -> Result<Value, JobError> {
        let params = Value::Object(params);
        let result = self
            .ctx
            .compute
            .exec(script, &self.working_dir(), &params, &self.cancel)
            .await?;
        debug!(script, result = %result, "script terminado");
        Ok(result)
    }

    /// Conexión del job o la del master; `None` = cálculo local.
    fn cluster_config(&self) -> Result<Option<ClusterConfig>, JobError> {
        let request = &self.job.request;
        if !request.compute_on_cluster {
            return Ok(None);
        }
        ClusterConfig::resolve(self.ctx.config.cluster.as_ref(), request.cluster.as_ref())
            .map(Some)
            .ok_or_else(|| {
                JobError::FatalSubmission("cálculo en cluster sin conexión configurada".into())
            })
    }

    /// Arma las unidades de trabajo desde los extractos de fuentes, las reparte
    /// y escribe `cluster_config.json`.
    async fn build_partitions(&self, wd: &Path, n: usize) -> Result<PartitionConfig, JobError> {
        let sources = self.ctx.config.sources.clone();
        let wd = wd.to_path_buf();
        let span = Span::current();

        let config = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            let mut units = Vec::new();
            for source in &sources {
                let path = wd.join(&source.file);
                if source.optional && !path.exists() {
                    debug!(category = %source.category, "fuente opcional ausente");
                    continue;
                }
                let found = units_from_geojson(&path, &source.key_field, &source.category)?;
                info!(category = %source.category, units = found.len(), "unidades de trabajo");
                units.extend(found);
            }
            if units.is_empty() {
                return Err(PartitionError::EmptyWorkload);
            }

            sort_heaviest_first(&mut units);
            let config = PartitionConfig::new(partition(&units, n));
            config.write(&wd.join(PARTITION_CONFIG_FILE))?;
            for p in &config.partitions {
                info!(
                    node = p.node_id,
                    weight = p.total_weight,
                    units = p.unit_ids.len(),
                    "partición"
                );
            }
            Ok(config)
        })
        .await
        .map_err(|e| JobError::Join(e.to_string()))??;

        Ok(config)
    }

    async fn compute_locally(
        &self,
        partitions: &PartitionConfig,
        progress: &dyn ProgressReporter,
    ) -> Result<(), JobError> {
        let total = partitions.len();
        for (done, p) in partitions.partitions.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(JobError::Canceled);
            }
            let mut params = self.base_params();
            params.insert("nodeId".into(), json!(p.node_id));
            params.insert("unitIds".into(), json!(p.unit_ids));
            params.insert("partitionConfig".into(), json!(PARTITION_CONFIG_FILE));
            self.run_script(scripts::NOISE_LEVEL, params).await?;
            progress.report_progress((done + 1) as f64 / total as f64);
        }
        Ok(())
    }

    async fn compute_on_cluster(
        &self,
        cluster: ClusterConfig,
        partitions: &PartitionConfig,
        wd: &Path,
        progress: &dyn ProgressReporter,
    ) -> Result<(), JobError> {
        let compute = &self.ctx.config.compute;
        let mut driver =
            RemoteExecutionDriver::new(self.ctx.connector.clone(), cluster, self.cancel.clone());
        driver.connect().await?;

        let root = driver.remote_root().await?;
        let job_dir = remote_join(&root, &format!("job_{}", self.job.id));

        let exclude: HashSet<PathBuf> = [RESULTS_DIR, RESULTS_POST_DIR, JOB_LOG_FILE]
            .into_iter()
            .map(PathBuf::from)
            .collect();
        driver.push(wd, &job_dir, true, &exclude).await?;
        driver
            .push(&compute.lib_dir, &remote_join(&job_dir, "lib"), true, &HashSet::new())
            .await?;
        let script = compute
            .batch_script
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| {
                JobError::FatalSubmission(format!(
                    "script de lote inválido: {}",
                    compute.batch_script.display()
                ))
            })?;
        driver
            .push(&compute.batch_script, &remote_join(&job_dir, &script), false, &HashSet::new())
            .await?;

        let remote_job_id = driver.submit_array(&script, partitions.len(), &job_dir).await?;
        if let Err(e) = self.ctx.store.set_remote_job_id(&self.job.id, &remote_job_id) {
            // sin el id guardado nadie podría cancelarlo después
            match driver.cancel_remote(&remote_job_id).await {
                Ok(()) => warn!(remote_job_id = %remote_job_id, "array cancelado: no se pudo registrar su id"),
                Err(cancel_err) => error!(
                    remote_job_id = %remote_job_id,
                    error = %cancel_err,
                    "no se pudo cancelar el array sin registrar"
                ),
            }
            return Err(e.into());
        }

        let array = driver
            .wait_for_completion(&remote_job_id, &job_dir, partitions.len(), progress)
            .await?;
        info!(remote_job_id = %remote_job_id, finished = array.finished, total = array.total, "array del cluster terminado");

        let home = driver.home_dir().await?;
        let remote_results = remote_join(&home, &format!("results_{remote_job_id}"));
        driver.pull(&remote_results, &wd.join(RESULTS_DIR)).await?;

        for dir in [&remote_results, &job_dir] {
            if let Err(e) = driver.remove_remote(dir).await {
                warn!(remote_dir = %dir, error = %e, "no se pudo limpiar el directorio remoto");
            }
        }
        Ok(())
    }

    async fn merge(&self, wd: &Path) -> Result<MergeReport, JobError> {
        let input = wd.join(RESULTS_DIR);
        let output = wd.join(RESULTS_POST_DIR);
        let settings = self.ctx.merge_settings.clone();
        let span = Span::current();

        let report = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            merge_results(&input, &output, &settings)
        })
        .await
        .map_err(|e| JobError::Join(e.to_string()))??;
        Ok(report)
    }
}

/// Cancela en el scheduler el array de un job cuyo runner ya no está para
/// hacerlo (abort forzado). Los fallos sólo quedan en el log.
pub async fn cancel_orphaned_array(ctx: &RunnerContext, job_id: &str) {
    let job = match ctx.store.get_job(job_id) {
        Ok(job) => job,
        Err(e) => {
            warn!(job_id, error = %e, "no se pudo leer el job para cancelar su array");
            return;
        }
    };
    let Some(remote_job_id) = job.remote_job_id else {
        return;
    };
    let Some(cluster) =
        ClusterConfig::resolve(ctx.config.cluster.as_ref(), job.request.cluster.as_ref())
    else {
        warn!(job_id, remote_job_id = %remote_job_id, "array sin conexión configurada para cancelarlo");
        return;
    };

    // token propio: el del job ya está cancelado
    let mut driver =
        RemoteExecutionDriver::new(ctx.connector.clone(), cluster, CancellationToken::new());
    let result = match driver.connect().await {
        Ok(()) => driver.cancel_remote(&remote_job_id).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => info!(job_id, remote_job_id = %remote_job_id, "array del job abortado cancelado"),
        Err(e) => error!(
            job_id,
            remote_job_id = %remote_job_id,
            error = %e,
            "no se pudo cancelar el array del job abortado"
        ),
    }
}

/// Cada partición tiene que haber dejado al menos un archivo; fusionar un
/// subconjunto dejaría huecos sin detectar.
fn verify_partition_outputs(
    results_dir: &Path,
    naming: &ResultNaming,
    partitions: usize,
) -> Result<(), JobError> {
    let base = glob::Pattern::escape(&results_dir.to_string_lossy());
    for index in 0..partitions {
        let pattern = format!("{}/{}", base, naming.partition_glob(index));
        let present = glob::glob(&pattern)
            .map(|mut paths| paths.any(|p| p.is_ok()))
            .unwrap_or(false);
        if !present {
            return Err(JobError::PartialOutput {
                partition: index,
                dir: results_dir.to_path_buf(),
            });
        }
    }
    Ok(())
}
