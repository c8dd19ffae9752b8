use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub type JobId = String;

/// Genera un identificador nuevo para un job.
pub fn new_job_id() -> JobId {
    uuid::Uuid::new_v4().to_string()
}

/// Parámetros de conexión al cluster enviados junto con el job.
/// Si vienen en la petición, reemplazan los del master para ese job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterConnection {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    /// Clave privada usada para autenticarse (ruta local del master)
    pub identity_file: String,
    /// Tipo y clave pública del host en los que confiamos, ej: "ssh-ed25519" + base64
    pub host_key_type: Option<String>,
    pub host_key: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    /// Id propuesto por quien envía el job; si falta, el master genera uno
    #[serde(default)]
    pub id: Option<JobId>,

    pub name: String,

    /// Selector del conjunto de datos a importar (ej: código de departamento)
    pub dataset: String,

    /// Identificador de la configuración del algoritmo
    pub configuration_id: i64,

    /// true = se reparte en el cluster, false = cálculo local
    #[serde(default)]
    pub compute_on_cluster: bool,

    #[serde(default)]
    pub cluster: Option<ClusterConnection>,

    /// Parámetros extra que se pasan tal cual a la librería de cálculo
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Running,
    Failed,
    Canceled,
    Completed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "QUEUED",
            JobState::Running => "RUNNING",
            JobState::Failed => "FAILED",
            JobState::Canceled => "CANCELED",
            JobState::Completed => "COMPLETED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Failed | JobState::Canceled | JobState::Completed
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(JobState::Queued),
            "RUNNING" => Ok(JobState::Running),
            "FAILED" => Ok(JobState::Failed),
            "CANCELED" => Ok(JobState::Canceled),
            "COMPLETED" => Ok(JobState::Completed),
            other => Err(format!("estado de job desconocido: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub name: String,
    pub state: JobState,

    /// 0..=100, sólo crece mientras el job está RUNNING
    pub progress_percent: f64,

    pub submitted_at: DateTime<Utc>,
    pub begin_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,

    /// Directorio de trabajo local del job
    pub working_directory: String,

    /// Id asignado por el scheduler remoto (sólo en modo cluster)
    pub remote_job_id: Option<String>,

    /// Petición original que creó el job
    pub request: JobRequest,
}
