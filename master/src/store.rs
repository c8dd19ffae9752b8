use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use common::{JobId, JobInfo, JobRequest, JobState};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::warn;

use crate::error::StoreError;
use crate::progress::ProgressReporter;

/// Estado persistido de los jobs. Cada job tiene un único escritor: su runner.
pub trait JobStore: Send + Sync {
    fn create_job(&self, job: &JobInfo) -> Result<(), StoreError>;
    fn get_job(&self, job_id: &str) -> Result<JobInfo, StoreError>;
    fn list_jobs(&self) -> Result<Vec<JobInfo>, StoreError>;

    /// Cambia el estado de un job que todavía no terminó.
    fn set_state(&self, job_id: &str, state: JobState) -> Result<(), StoreError>;
    fn set_begin_time(&self, job_id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Sólo sube, y sólo mientras el job está RUNNING. Si no aplica, no hace nada.
    fn set_progress(&self, job_id: &str, percent: f64) -> Result<(), StoreError>;

    /// Una sola vez y sólo mientras el job está RUNNING.
    fn set_remote_job_id(&self, job_id: &str, remote_job_id: &str) -> Result<(), StoreError>;

    /// Estado final, hora de fin y progreso 100.
    fn finish(&self, job_id: &str, state: JobState) -> Result<(), StoreError>;

    /// Jobs que un proceso anterior dejó a medias pasan a FAILED.
    fn reconcile_interrupted(&self) -> Result<Vec<JobId>, StoreError>;

    /// Borra la fila sin mirar el estado; quien llama se asegura de que el
    /// job ya no corra.
    fn delete_job(&self, job_id: &str) -> Result<(), StoreError>;
}

const SCHEMA: &str = r#"
    PRAGMA journal_mode=WAL;

    CREATE TABLE IF NOT EXISTS jobs (
      id TEXT PRIMARY KEY,
      name TEXT NOT NULL,
      state TEXT NOT NULL,
      progress REAL NOT NULL DEFAULT 0,
      submitted_at TEXT NOT NULL,
      begin_time TEXT,
      end_time TEXT,
      working_directory TEXT NOT NULL,
      remote_job_id TEXT,
      request_json TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
"#;

const TERMINAL_STATES: &str = "('FAILED', 'CANCELED', 'COMPLETED')";

/// Una conexión corta por operación, sin transacciones largas.
pub struct SqliteJobStore {
    path: PathBuf,
}

impl SqliteJobStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let store = Self { path };
        store.connect()?.execute_batch(SCHEMA)?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    fn current_state(conn: &Connection, job_id: &str) -> Result<JobState, StoreError> {
        let state: Option<String> = conn
            .query_row(
                "SELECT state FROM jobs WHERE id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        let state = state.ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
        state.parse().map_err(|detail| StoreError::Corrupt {
            job_id: job_id.to_string(),
            detail,
        })
    }

    fn invalid(job_id: &str, detail: impl Into<String>) -> StoreError {
        StoreError::InvalidTransition {
            job_id: job_id.to_string(),
            detail: detail.into(),
        }
    }
}

fn parse_time(job_id: &str, value: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    value
        .map(|text| {
            DateTime::parse_from_rfc3339(&text)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| StoreError::Corrupt {
                    job_id: job_id.to_string(),
                    detail: format!("fecha inválida {text:?}: {e}"),
                })
        })
        .transpose()
}

struct RawJob {
    id: String,
    name: String,
    state: String,
    progress: f64,
    submitted_at: String,
    begin_time: Option<String>,
    end_time: Option<String>,
    working_directory: String,
    remote_job_id: Option<String>,
    request_json: String,
}

const SELECT_JOB: &str = "SELECT id, name, state, progress, submitted_at, begin_time, end_time, \
     working_directory, remote_job_id, request_json FROM jobs";

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawJob> {
    Ok(RawJob {
        id: row.get(0)?,
        name: row.get(1)?,
        state: row.get(2)?,
        progress: row.get(3)?,
        submitted_at: row.get(4)?,
        begin_time: row.get(5)?,
        end_time: row.get(6)?,
        working_directory: row.get(7)?,
        remote_job_id: row.get(8)?,
        request_json: row.get(9)?,
    })
}

impl RawJob {
    fn into_job(self) -> Result<JobInfo, StoreError> {
        let corrupt = |detail: String| StoreError::Corrupt {
            job_id: self.id.clone(),
            detail,
        };
        let state: JobState = self.state.parse().map_err(corrupt)?;
        let request: JobRequest =
            serde_json::from_str(&self.request_json).map_err(|e| corrupt(e.to_string()))?;
        let submitted_at = parse_time(&self.id, Some(self.submitted_at.clone()))?
            .ok_or_else(|| corrupt("sin fecha de envío".into()))?;

        Ok(JobInfo {
            state,
            progress_percent: self.progress,
            submitted_at,
            begin_time: parse_time(&self.id, self.begin_time.clone())?,
            end_time: parse_time(&self.id, self.end_time.clone())?,
            working_directory: self.working_directory.clone(),
            remote_job_id: self.remote_job_id.clone(),
            request,
            name: self.name.clone(),
            id: self.id,
        })
    }
}

impl JobStore for SqliteJobStore {
    fn create_job(&self, job: &JobInfo) -> Result<(), StoreError> {
        let request_json = serde_json::to_string(&job.request).map_err(|e| StoreError::Corrupt {
            job_id: job.id.clone(),
            detail: e.to_string(),
        })?;
        let inserted = self.connect()?.execute(
            "INSERT OR IGNORE INTO jobs (id, name, state, progress, submitted_at, begin_time, \
             end_time, working_directory, remote_job_id, request_json) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                job.id,
                job.name,
                job.state.as_str(),
                job.progress_percent,
                job.submitted_at.to_rfc3339(),
                job.begin_time.map(|t| t.to_rfc3339()),
                job.end_time.map(|t| t.to_rfc3339()),
                job.working_directory,
                job.remote_job_id,
                request_json,
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::Duplicate {
                job_id: job.id.clone(),
            });
        }
        Ok(())
    }

    fn get_job(&self, job_id: &str) -> Result<JobInfo, StoreError> {
        let raw = self
            .connect()?
            .query_row(
                &format!("{SELECT_JOB} WHERE id = ?1"),
                params![job_id],
                read_row,
            )
            .optional()?;
        raw.ok_or_else(|| StoreError::NotFound(job_id.to_string()))?
            .into_job()
    }

    fn list_jobs(&self) -> Result<Vec<JobInfo>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!("{SELECT_JOB} ORDER BY submitted_at DESC"))?;
        let rows = stmt.query_map([], read_row)?;
        let mut jobs = Vec::new();
        for raw in rows {
            jobs.push(raw?.into_job()?);
        }
        Ok(jobs)
    }

    fn set_state(&self, job_id: &str, state: JobState) -> Result<(), StoreError> {
        let conn = self.connect()?;
        let updated = conn.execute(
            &format!("UPDATE jobs SET state = ?2 WHERE id = ?1 AND state NOT IN {TERMINAL_STATES}"),
            params![job_id, state.as_str()],
        )?;
        if updated == 0 {
            let current = Self::current_state(&conn, job_id)?;
            return Err(Self::invalid(job_id, format!("{current} -> {state}")));
        }
        Ok(())
    }

    fn set_begin_time(&self, job_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let updated = self.connect()?.execute(
            "UPDATE jobs SET begin_time = ?2 WHERE id = ?1",
            params![job_id, at.to_rfc3339()],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(job_id.to_string()));
        }
        Ok(())
    }

    fn set_progress(&self, job_id: &str, percent: f64) -> Result<(), StoreError> {
        self.connect()?.execute(
            "UPDATE jobs SET progress = ?2 WHERE id = ?1 AND state = 'RUNNING' AND progress < ?2",
            params![job_id, percent.clamp(0.0, 100.0)],
        )?;
        Ok(())
    }

    fn set_remote_job_id(&self, job_id: &str, remote_job_id: &str) -> Result<(), StoreError> {
        let conn = self.connect()?;
        let updated = conn.execute(
            "UPDATE jobs SET remote_job_id = ?2 \
             WHERE id = ?1 AND state = 'RUNNING' AND remote_job_id IS NULL",
            params![job_id, remote_job_id],
        )?;
        if updated == 0 {
            let current = Self::current_state(&conn, job_id)?;
            return Err(Self::invalid(
                job_id,
                format!("no se puede asignar el id remoto {remote_job_id} (estado {current} o ya asignado)"),
            ));
        }
        Ok(())
    }

    fn finish(&self, job_id: &str, state: JobState) -> Result<(), StoreError> {
        if !state.is_terminal() {
            return Err(Self::invalid(job_id, format!("{state} no es un estado final")));
        }
        let conn = self.connect()?;
        let updated = conn.execute(
            &format!(
                "UPDATE jobs SET state = ?2, end_time = ?3, progress = 100 \
                 WHERE id = ?1 AND state NOT IN {TERMINAL_STATES}"
            ),
            params![job_id, state.as_str(), Utc::now().to_rfc3339()],
        )?;
        if updated == 0 {
            let current = Self::current_state(&conn, job_id)?;
            return Err(Self::invalid(job_id, format!("ya terminó en {current}")));
        }
        Ok(())
    }

    fn reconcile_interrupted(&self) -> Result<Vec<JobId>, StoreError> {
        let conn = self.connect()?;
        let ids: Vec<JobId> = {
            let mut stmt =
                conn.prepare("SELECT id FROM jobs WHERE state IN ('QUEUED', 'RUNNING')")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<_, _>>()?
        };
        let now = Utc::now().to_rfc3339();
        for id in &ids {
            conn.execute(
                "UPDATE jobs SET state = 'FAILED', end_time = ?2, progress = 100 WHERE id = ?1",
                params![id, now],
            )?;
        }
        Ok(ids)
    }

    fn delete_job(&self, job_id: &str) -> Result<(), StoreError> {
        let deleted = self
            .connect()?
            .execute("DELETE FROM jobs WHERE id = ?1", params![job_id])?;
        if deleted == 0 {
            return Err(StoreError::NotFound(job_id.to_string()));
        }
        Ok(())
    }
}

/* ---------------- progreso con debounce ---------------- */

/// Tope de lo que se persiste como avance; el 100 lo escribe `finish`.
const MAX_REPORTED_PERCENT: f64 = 99.0;

struct DebounceState {
    last_write: Option<Instant>,
    last_percent: f64,
    /// Último valor que cayó dentro del intervalo y no se escribió
    pending: Option<f64>,
}

/// Persiste el avance de un job como mucho una vez por `min_interval`. Lo
/// que queda retenido se escribe en `flush` o al soltarlo.
pub struct DebouncedProgress {
    store: Arc<dyn JobStore>,
    job_id: JobId,
    min_interval: Duration,
    state: Mutex<DebounceState>,
}

impl DebouncedProgress {
    pub fn new(store: Arc<dyn JobStore>, job_id: JobId, min_interval: Duration) -> Self {
        Self {
            store,
            job_id,
            min_interval,
            state: Mutex::new(DebounceState {
                last_write: None,
                last_percent: 0.0,
                pending: None,
            }),
        }
    }

    fn write(&self, state: &mut DebounceState, percent: f64) {
        state.last_write = Some(Instant::now());
        state.last_percent = percent;
        state.pending = None;

        let store = self.store.clone();
        let job_id = self.job_id.clone();
        let persist = move || {
            if let Err(e) = store.set_progress(&job_id, percent) {
                warn!(job_id = %job_id, error = %e, "no se pudo guardar el progreso");
            }
        };
        // set_progress sólo sube, el orden de llegada no importa
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(persist);
            }
            Err(_) => persist(),
        }
    }
}

impl ProgressReporter for DebouncedProgress {
    fn report_progress(&self, fraction: f64) {
        let percent = (fraction * 100.0).clamp(0.0, MAX_REPORTED_PERCENT);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if percent <= state.last_percent {
            return;
        }
        if let Some(last) = state.last_write {
            if last.elapsed() < self.min_interval {
                state.pending = Some(state.pending.map_or(percent, |p| p.max(percent)));
                return;
            }
        }
        self.write(&mut state, percent);
    }

    fn flush(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(percent) = state.pending.take() {
            if percent > state.last_percent {
                self.write(&mut state, percent);
            }
        }
    }
}

impl Drop for DebouncedProgress {
    fn drop(&mut self) {
        self.flush();
    }
}
