use serde::{Deserialize, Serialize};

use crate::job::{JobId, JobState};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultFile {
    pub name: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResults {
    pub job_id: JobId,
    pub state: JobState,
    /// Directorio donde quedaron las tablas fusionadas de este job
    pub output_dir: String,
    /// Archivos dentro de output_dir
    pub files: Vec<ResultFile>,
}

/// Respuesta de `POST /api/v1/jobs/:id/cancel`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub job_id: JobId,
    /// false si el job no estaba en curso en este master
    pub accepted: bool,
}

/// Respuesta de `GET /api/v1/jobs/:id/logs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogsResponse {
    pub job_id: JobId,
    /// true si viene del joblog.txt persistido, false si es el buffer en vivo
    pub persisted: bool,
    pub lines: Vec<String>,
}
