//! Ejecución remota sobre un cluster con Slurm: subir el directorio del job,
//! lanzar el array de tareas, seguirlo hasta el final y traer los resultados.

pub mod shell;

#[cfg(test)]
pub(crate) mod fake;

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use common::{task, RemoteTaskStatus};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::ClusterConfig;
use crate::error::{JobError, RemoteError};
use crate::progress::ProgressReporter;

pub use shell::{
    remote_join, shell_quote, OpenSshConnector, RemoteConnector, RemoteEntry, RemoteShell,
};

const LOG_SUFFIX: &str = ".out";

/// Qué subir de `root`: rutas relativas y si son directorios, padres antes
/// que hijos. Lo excluido no se recorre.
fn upload_plan(
    root: &Path,
    recursive: bool,
    exclude: &HashSet<PathBuf>,
) -> Result<Vec<(PathBuf, bool)>, walkdir::Error> {
    let walker = WalkDir::new(root)
        .follow_links(true)
        .sort_by_file_name()
        .max_depth(if recursive { usize::MAX } else { 1 });

    let mut plan = Vec::new();
    for entry in walker.into_iter().filter_entry(|e| {
        e.path()
            .strip_prefix(root)
            .map_or(true, |relative| !exclude.contains(relative))
    }) {
        let entry = entry?;
        let is_dir = entry.file_type().is_dir();
        // sin recursión sólo se suben los archivos de primer nivel
        if is_dir && entry.depth() > 0 && !recursive {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_path_buf();
        plan.push((relative, is_dir));
    }
    Ok(plan)
}

fn remote_path(base: &str, relative: &Path) -> String {
    relative
        .components()
        .fold(base.to_string(), |acc, c| {
            remote_join(&acc, &c.as_os_str().to_string_lossy())
        })
}

/// Resultado del seguimiento de un array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayProgress {
    pub finished: usize,
    pub total: usize,
}

pub struct RemoteExecutionDriver {
    connector: Arc<dyn RemoteConnector>,
    config: ClusterConfig,
    cancel: CancellationToken,
    shell: Option<Box<dyn RemoteShell>>,
    /// Bytes ya mostrados de cada archivo de log remoto
    log_offsets: HashMap<String, u64>,
}

impl RemoteExecutionDriver {
    pub fn new(
        connector: Arc<dyn RemoteConnector>,
        config: ClusterConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connector,
            config,
            cancel,
            shell: None,
            log_offsets: HashMap::new(),
        }
    }

    fn shell(&self) -> Result<&dyn RemoteShell, RemoteError> {
        self.shell
            .as_deref()
            .ok_or_else(|| RemoteError::Connection {
                host: self.config.host.clone(),
                message: "sin sesión abierta".to_string(),
            })
    }

    /// Duerme `delay` salvo que se cancele antes.
    async fn pause(&self, delay: Duration) -> Result<(), RemoteError> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.cancel.cancelled() => Err(RemoteError::Canceled),
        }
    }

    fn check_canceled(&self) -> Result<(), RemoteError> {
        if self.cancel.is_cancelled() {
            return Err(RemoteError::Canceled);
        }
        Ok(())
    }

    async fn open_session(&mut self) -> Result<(), RemoteError> {
        self.shell = None;
        let shell = self.connector.connect(&self.config).await?;
        self.shell = Some(shell);
        Ok(())
    }

    /// Abre la sesión; los fallos transitorios se reintentan hasta
    /// `max_connection_retries` veces.
    pub async fn connect(&mut self) -> Result<(), RemoteError> {
        let mut attempt = 0;
        loop {
            self.check_canceled()?;
            match self.open_session().await {
                Ok(()) => {
                    info!(host = %self.config.host, "conectado al cluster");
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < self.config.max_connection_retries => {
                    attempt += 1;
                    warn!(
                        host = %self.config.host,
                        attempt,
                        error = %e,
                        "conexión fallida, reintentando"
                    );
                    self.pause(self.config.retry_delay()).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Directorio raíz remoto de los jobs (absoluto).
    pub async fn remote_root(&self) -> Result<String, RemoteError> {
        if self.config.remote_root.starts_with('/') {
            return Ok(self.config.remote_root.clone());
        }
        let home = self.shell()?.home_dir().await?;
        Ok(remote_join(&home, &self.config.remote_root))
    }

    pub async fn home_dir(&self) -> Result<String, RemoteError> {
        self.shell()?.home_dir().await
    }

    /* ---------------- subida ---------------- */

    /// Copia `local` (archivo o directorio) a `remote`. Los nombres en
    /// `exclude` son rutas relativas a `local` que no se suben.
    /// Devuelve la cantidad de archivos copiados.
    pub async fn push(
        &self,
        local: &Path,
        remote: &str,
        recursive: bool,
        exclude: &HashSet<PathBuf>,
    ) -> Result<usize, RemoteError> {
        let mut attempt = 0;
        loop {
            self.check_canceled()?;
            match self.push_once(local, remote, recursive, exclude).await {
                Ok(count) => {
                    debug!(local = %local.display(), remote, files = count, "subida completa");
                    return Ok(count);
                }
                Err(e) if e.is_transient() && attempt < self.config.max_transfer_retries => {
                    attempt += 1;
                    warn!(local = %local.display(), attempt, error = %e, "subida fallida, reintentando");
                    self.pause(self.config.retry_delay()).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn push_once(
        &self,
        local: &Path,
        remote: &str,
        recursive: bool,
        exclude: &HashSet<PathBuf>,
    ) -> Result<usize, RemoteError> {
        let shell = self.shell()?;
        let local_io = |source: std::io::Error| RemoteError::LocalIo {
            path: local.to_path_buf(),
            source,
        };

        if local.is_file() {
            shell.put_file(local, remote).await?;
            return Ok(1);
        }

        let plan = {
            let root = local.to_path_buf();
            let exclude = exclude.clone();
            tokio::task::spawn_blocking(move || upload_plan(&root, recursive, &exclude))
                .await
                .map_err(|e| local_io(std::io::Error::other(e)))?
                .map_err(|e| local_io(e.into()))?
        };

        let mut copied = 0;
        for (relative, is_dir) in plan {
            self.check_canceled()?;
            let target = remote_path(remote, &relative);
            if is_dir {
                if !shell.dir_exists(&target).await? {
                    shell.mkdir(&target).await?;
                }
            } else {
                shell.put_file(&local.join(&relative), &target).await?;
                copied += 1;
            }
        }
        Ok(copied)
    }

    /* ---------------- scheduler ---------------- */

    /// `sbatch --array=0-<n-1>` desde `workdir`. Sin identificador en la
    /// respuesta no hay nada que seguir: error fatal.
    pub async fn submit_array(
        &self,
        script: &str,
        task_count: usize,
        workdir: &str,
    ) -> Result<String, JobError> {
        if task_count == 0 {
            return Err(JobError::FatalSubmission(
                "array de tareas vacío".to_string(),
            ));
        }
        let command = format!(
            "cd {} && sbatch --array=0-{} {}",
            shell_quote(workdir),
            task_count - 1,
            shell_quote(script)
        );
        let output = self.shell()?.exec(&command).await?;
        let stdout = output.stdout_text();
        if !output.success() {
            return Err(JobError::FatalSubmission(format!(
                "sbatch terminó con código {:?}: {}",
                output.status, output.stderr
            )));
        }
        let remote_job_id = task::parse_submission_output(&stdout).ok_or_else(|| {
            JobError::FatalSubmission(format!("respuesta de sbatch sin identificador: {stdout:?}"))
        })?;
        info!(remote_job_id = %remote_job_id, tasks = task_count, "array enviado");
        Ok(remote_job_id)
    }

    /// Estado de las tareas del array. Si alguna terminó en falla se cancela
    /// el array entero.
    pub async fn poll_status(&self, remote_job_id: &str) -> Result<Vec<RemoteTaskStatus>, JobError> {
        let command = format!(
            "sacct --format JobID%30,JobName%30,State -j {}",
            shell_quote(remote_job_id)
        );
        let output = self.shell()?.exec(&command).await?;
        if !output.success() {
            return Err(RemoteError::CommandFailed {
                command,
                status: output.status,
                stderr: output.stderr,
            }
            .into());
        }
        let statuses = task::parse_accounting_output(&output.stdout_text(), remote_job_id);

        if let Some(failed) = statuses.iter().find(|s| s.is_failure()) {
            warn!(
                remote_job_id,
                task = failed.task_index,
                status = %failed.status_code,
                "tarea remota fallida, cancelando el array"
            );
            if let Err(e) = self.cancel_remote(remote_job_id).await {
                warn!(remote_job_id, error = %e, "no se pudo cancelar el array");
            }
            return Err(JobError::RemoteTaskFailure {
                remote_job_id: remote_job_id.to_string(),
                task_index: failed.task_index,
                status: failed.status_code.clone(),
            });
        }
        Ok(statuses)
    }

    /// `scancel`, sin esperar a que el scheduler confirme.
    pub async fn cancel_remote(&self, remote_job_id: &str) -> Result<(), RemoteError> {
        let command = format!("scancel {}", shell_quote(remote_job_id));
        let output = self.shell()?.exec(&command).await?;
        if !output.success() {
            return Err(RemoteError::CommandFailed {
                command,
                status: output.status,
                stderr: output.stderr,
            });
        }
        info!(remote_job_id, "cancelación enviada al scheduler");
        Ok(())
    }

    /* ---------------- logs ---------------- */

    /// Muestra lo nuevo de cada `*.out` de `remote_dir` desde la última
    /// llamada. Devuelve `(archivo, texto)` de lo que se leyó.
    pub async fn tail_remote_logs(
        &mut self,
        remote_dir: &str,
    ) -> Result<Vec<(String, String)>, RemoteError> {
        let shell = self
            .shell
            .as_deref()
            .ok_or_else(|| RemoteError::Connection {
                host: self.config.host.clone(),
                message: "sin sesión abierta".to_string(),
            })?;

        let mut logs: Vec<RemoteEntry> = shell
            .list_dir(remote_dir)
            .await?
            .into_iter()
            .filter(|e| !e.is_dir && e.name.ends_with(LOG_SUFFIX))
            .collect();
        logs.sort_by(|a, b| a.name.cmp(&b.name));

        let mut chunks = Vec::new();
        for entry in logs {
            let offset = self.log_offsets.get(&entry.name).copied().unwrap_or(0);
            if entry.size <= offset {
                continue;
            }
            let path = remote_join(remote_dir, &entry.name);
            let bytes = shell.read_from(&path, offset).await?;
            if bytes.is_empty() {
                continue;
            }
            self.log_offsets
                .insert(entry.name.clone(), offset + bytes.len() as u64);

            let text = String::from_utf8_lossy(&bytes).to_string();
            for line in text.lines().filter(|l| !l.trim().is_empty()) {
                info!(file = %entry.name, "{line}");
            }
            chunks.push((entry.name, text));
        }
        Ok(chunks)
    }

    /* ---------------- bajada ---------------- */

    /// Copia `remote_dir` completo a `local_dir`. Si el directorio remoto no
    /// existe no hay nada que traer (0 archivos).
    pub async fn pull(&self, remote_dir: &str, local_dir: &Path) -> Result<usize, RemoteError> {
        if !self.shell()?.dir_exists(remote_dir).await? {
            warn!(remote_dir, "no hay resultados remotos para traer");
            return Ok(0);
        }

        let mut attempt = 0;
        loop {
            self.check_canceled()?;
            match self.pull_once(remote_dir, local_dir).await {
                Ok(count) => {
                    info!(remote_dir, local = %local_dir.display(), files = count, "resultados descargados");
                    return Ok(count);
                }
                Err(e) if e.is_transient() && attempt < self.config.max_transfer_retries => {
                    attempt += 1;
                    warn!(remote_dir, attempt, error = %e, "descarga fallida, reintentando");
                    self.pause(self.config.retry_delay()).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn pull_once(&self, remote_dir: &str, local_dir: &Path) -> Result<usize, RemoteError> {
        let shell = self.shell()?;
        let mut copied = 0;
        let mut pending = vec![(remote_dir.to_string(), local_dir.to_path_buf())];
        while let Some((dir, local)) = pending.pop() {
            tokio::fs::create_dir_all(&local)
                .await
                .map_err(|source| RemoteError::LocalIo {
                    path: local.clone(),
                    source,
                })?;
            for entry in shell.list_dir(&dir).await? {
                self.check_canceled()?;
                let remote_path = remote_join(&dir, &entry.name);
                let local_path = local.join(&entry.name);
                if entry.is_dir {
                    pending.push((remote_path, local_path));
                } else {
                    shell.get_file(&remote_path, &local_path).await?;
                    copied += 1;
                }
            }
        }
        Ok(copied)
    }

    pub async fn remove_remote(&self, remote_dir: &str) -> Result<(), RemoteError> {
        self.shell()?.remove_dir_all(remote_dir).await
    }

    /* ---------------- espera ---------------- */

    /// Sigue el array hasta que las `task_count` tareas terminen bien.
    ///
    /// Entre consultas duerme el intervalo configurado menos lo que tardó la
    /// consulta, nunca menos que `min_poll_sleep`. Si se cae la conexión
    /// reconecta, hasta `max_connection_retries` veces seguidas.
    pub async fn wait_for_completion(
        &mut self,
        remote_job_id: &str,
        log_dir: &str,
        task_count: usize,
        progress: &dyn ProgressReporter,
    ) -> Result<ArrayProgress, JobError> {
        let mut reconnects = 0;
        loop {
            if self.cancel.is_cancelled() {
                if let Err(e) = self.cancel_remote(remote_job_id).await {
                    warn!(remote_job_id, error = %e, "no se pudo cancelar el array");
                }
                return Err(JobError::Canceled);
            }

            let started = Instant::now();
            match self.poll_status(remote_job_id).await {
                Ok(statuses) => {
                    reconnects = 0;
                    if let Err(e) = self.tail_remote_logs(log_dir).await {
                        warn!(error = %e, "no se pudieron leer los logs remotos");
                    }

                    let finished = statuses.iter().filter(|s| s.is_terminal()).count();
                    progress.report_progress(finished as f64 / task_count.max(1) as f64);
                    if finished >= task_count {
                        return Ok(ArrayProgress {
                            finished,
                            total: task_count,
                        });
                    }
                }
                Err(JobError::TransientTransport(e)) => {
                    reconnects += 1;
                    if reconnects > self.config.max_connection_retries {
                        return Err(JobError::TransientTransport(e));
                    }
                    warn!(remote_job_id, attempt = reconnects, error = %e, "conexión perdida, reconectando");
                    if let Err(e) = self.open_session().await {
                        warn!(error = %e, "reconexión fallida");
                    }
                }
                Err(e) => return Err(e),
            }

            let sleep = self
                .config
                .poll_interval()
                .saturating_sub(started.elapsed())
                .max(self.config.min_poll_sleep());
            // un cancel durante la pausa se atiende arriba
            let _ = self.pause(sleep).await;
        }
    }
}
