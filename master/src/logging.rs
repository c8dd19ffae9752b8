//! Logs del master: stdout + archivo, y captura de las líneas de cada job.
//!
//! Todo lo que se loguea dentro de un span con campo `job_id` se copia al
//! buffer de ese job en [`JobLogRegistry`]. El runner vuelca ese buffer a
//! `joblog.txt` al terminar.

use std::{
    collections::{HashMap, VecDeque},
    fmt::Write as _,
    fs, io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{SecondsFormat, Utc};
use common::JobId;
use tracing::{
    field::{Field, Visit},
    span::{Attributes, Id},
    Event, Subscriber,
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    layer::{Context, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::LoggingConfig;

const DEFAULT_FILTER: &str = "master=debug,common=info,axum=info";

/// Mantener vivo mientras corre el proceso; al soltarlo se vacía el archivo de log.
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

pub fn init_logging(
    config: &LoggingConfig,
    registry: JobLogRegistry,
) -> Result<LoggingGuard, io::Error> {
    fs::create_dir_all(&config.log_dir)?;

    let file_appender = tracing_appender::rolling::never(&config.log_dir, &config.log_file);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false);
    let stdout_layer = tracing_subscriber::fmt::layer().with_writer(io::stdout);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .with(JobLogLayer::new(registry))
        .init();

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

/* ---------------- buffers por job ---------------- */

/// Últimas líneas de log de cada job en curso.
#[derive(Clone)]
pub struct JobLogRegistry {
    buffers: Arc<Mutex<HashMap<JobId, VecDeque<String>>>>,
    capacity: usize,
}

impl JobLogRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, VecDeque<String>>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Empieza a capturar las líneas de un job.
    pub fn start(&self, job_id: &str) {
        self.lock().entry(job_id.to_string()).or_default();
    }

    /// Las líneas de jobs que no están capturando se descartan.
    pub fn push(&self, job_id: &str, line: String) {
        let mut buffers = self.lock();
        if let Some(buffer) = buffers.get_mut(job_id) {
            if buffer.len() >= self.capacity {
                buffer.pop_front();
            }
            buffer.push_back(line);
        }
    }

    /// Copia de las últimas `limit` líneas (todas si es `None`).
    pub fn tail(&self, job_id: &str, limit: Option<usize>) -> Option<Vec<String>> {
        let buffers = self.lock();
        let buffer = buffers.get(job_id)?;
        let skip = limit.map_or(0, |n| buffer.len().saturating_sub(n));
        Some(buffer.iter().skip(skip).cloned().collect())
    }

    /// Saca el buffer del job; deja de capturar.
    pub fn take(&self, job_id: &str) -> Option<Vec<String>> {
        self.lock().remove(job_id).map(Vec::from)
    }
}

/* ---------------- Layer ---------------- */

struct JobTag(JobId);

pub struct JobLogLayer {
    registry: JobLogRegistry,
}

impl JobLogLayer {
    pub fn new(registry: JobLogRegistry) -> Self {
        Self { registry }
    }
}

impl<S> Layer<S> for JobLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut visitor = JobIdVisitor::default();
        attrs.record(&mut visitor);
        if let (Some(job_id), Some(span)) = (visitor.job_id, ctx.span(id)) {
            span.extensions_mut().insert(JobTag(job_id));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let Some(scope) = ctx.event_scope(event) else {
            return;
        };
        let Some(job_id) = scope.into_iter().find_map(|span| {
            let extensions = span.extensions();
            extensions.get::<JobTag>().map(|tag| tag.0.clone())
        }) else {
            return;
        };

        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);

        let line = format!(
            "[JOB_{job_id}] {} {} - {}{}",
            event.metadata().level(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            visitor.message,
            visitor.fields
        );
        self.registry.push(&job_id, line);
    }
}

#[derive(Default)]
struct JobIdVisitor {
    job_id: Option<String>,
}

impl Visit for JobIdVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "job_id" {
            self.job_id = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "job_id" {
            self.job_id = Some(format!("{value:?}"));
        }
    }
}

/// Mensaje + `clave=valor` del resto de los campos.
#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}
