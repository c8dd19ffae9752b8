use std::error::Error as StdError;
use std::io;
use std::path::PathBuf;

use common::{JobId, MergeError, PartitionError};
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no se pudo leer la configuración {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("configuración TOML inválida en {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("valor inválido para {var}: {value:?}")]
    InvalidEnv { var: String, value: String },

    #[error("configuración inválida: {0}")]
    Invalid(String),
}

/// Errores de la sesión remota (ssh/scp) y del scheduler.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("no se pudo lanzar {program}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("el comando remoto `{command}` falló (código {status:?}): {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("sin conexión con {host}: {message}")]
    Connection { host: String, message: String },

    #[error("el host {host} no es de confianza, claves presentadas: {presented}")]
    UntrustedHost { host: String, presented: String },

    #[error("transferencia de {path} falló: {message}")]
    Transfer { path: String, message: String },

    #[error("error de E/S local en {path}")]
    LocalIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("operación remota cancelada")]
    Canceled,
}

/// Código con el que ssh reporta errores propios (no del comando remoto).
pub const SSH_TRANSPORT_EXIT_CODE: i32 = 255;

impl RemoteError {
    /// Fallas que vale la pena reintentar: transporte, no lógica.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Connection { .. } | RemoteError::Transfer { .. } => true,
            RemoteError::CommandFailed { status, .. } => *status == Some(SSH_TRANSPORT_EXIT_CODE),
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum ComputeError {
    #[error("no se pudo lanzar {program}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("el script {script} falló (código {status:?}): {stderr}")]
    Failed {
        script: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("cálculo cancelado")]
    Canceled,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("error de SQLite")]
    Sqlite(#[from] rusqlite::Error),

    #[error("no se pudo crear el directorio de la base {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("job no encontrado: {0}")]
    NotFound(JobId),

    #[error("el job {job_id} ya existe")]
    Duplicate { job_id: JobId },

    #[error("transición inválida para el job {job_id}: {detail}")]
    InvalidTransition { job_id: JobId, detail: String },

    #[error("fila corrupta para el job {job_id}: {detail}")]
    Corrupt { job_id: JobId, detail: String },
}

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("el job {0} ya está en ejecución")]
    Duplicate(JobId),
}

/// Todo lo que puede terminar un job antes de tiempo.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("fallo de transporte remoto (reintentos agotados)")]
    TransientTransport(#[source] RemoteError),

    #[error("el scheduler rechazó el envío: {0}")]
    FatalSubmission(String),

    #[error("la tarea {task_index} del job remoto {remote_job_id} terminó en {status}")]
    RemoteTaskFailure {
        remote_job_id: String,
        task_index: usize,
        status: String,
    },

    #[error("faltan los resultados de la partición {partition} en {dir}")]
    PartialOutput { partition: usize, dir: PathBuf },

    #[error("error de E/S local en {path}")]
    LocalIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("error remoto")]
    Remote(#[source] RemoteError),

    #[error("error de la librería de cálculo")]
    Compute(#[source] ComputeError),

    #[error("error al fusionar resultados")]
    Merge(#[from] MergeError),

    #[error("error al particionar")]
    Partition(#[from] PartitionError),

    #[error("error del almacén de jobs")]
    Store(#[from] StoreError),

    #[error("la fusión terminó abruptamente: {0}")]
    Join(String),

    /// No es una falla: el job termina en CANCELED.
    #[error("job cancelado")]
    Canceled,
}

impl JobError {
    pub fn local_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        JobError::LocalIo {
            path: path.into(),
            source,
        }
    }
}

impl From<RemoteError> for JobError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Canceled => JobError::Canceled,
            e if e.is_transient() => JobError::TransientTransport(e),
            e => JobError::Remote(e),
        }
    }
}

impl From<ComputeError> for JobError {
    fn from(err: ComputeError) -> Self {
        match err {
            ComputeError::Canceled => JobError::Canceled,
            e => JobError::Compute(e),
        }
    }
}

/// Mensaje de cada nivel de la cadena de causas, del más externo al más interno.
pub fn error_chain(err: &(dyn StdError + 'static)) -> Vec<String> {
    let mut chain = vec![err.to_string()];
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push(cause.to_string());
        source = cause.source();
    }
    chain
}

/// Loguea toda la cadena de causas, un `error!` por nivel.
pub fn log_error_chain(err: &(dyn StdError + 'static)) {
    let chain = error_chain(err);
    for (depth, message) in chain.iter().enumerate() {
        if depth == 0 {
            error!("{message}");
        } else {
            error!(depth, "causado por: {message}");
        }
    }
}
