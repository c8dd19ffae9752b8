use serde::{Deserialize, Serialize};

/// Token que precede al id del job en la salida de `sbatch`.
pub const SUBMISSION_TOKEN: &str = "Submitted batch job";

/// Estado de una tarea del array, tal como lo reporta la contabilidad del scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTaskStatus {
    pub status_code: String,
    pub task_index: usize,
}

/// Cómo interpretar un código de estado del scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownStatus {
    pub terminal: bool,
    pub failure: bool,
}

impl KnownStatus {
    const fn pending() -> Self {
        Self {
            terminal: false,
            failure: false,
        }
    }

    const fn done() -> Self {
        Self {
            terminal: true,
            failure: false,
        }
    }

    const fn failed() -> Self {
        Self {
            terminal: true,
            failure: true,
        }
    }
}

/* --------- Tabla de estados conocidos (Slurm) --------- */

const KNOWN_STATUSES: &[(&str, KnownStatus)] = &[
    ("COMPLETED", KnownStatus::done()),
    ("STOPPED", KnownStatus::done()),
    ("COMPLETING", KnownStatus::pending()),
    ("PENDING", KnownStatus::pending()),
    ("PREEMPTED", KnownStatus::pending()),
    ("RUNNING", KnownStatus::pending()),
    ("SUSPENDED", KnownStatus::pending()),
    ("REQUEUED", KnownStatus::pending()),
    ("FAILED", KnownStatus::failed()),
    ("CANCELLED", KnownStatus::failed()),
    ("CANCELED", KnownStatus::failed()),
    ("TIMEOUT", KnownStatus::failed()),
    ("NODE_FAIL", KnownStatus::failed()),
    ("OUT_OF_MEMORY", KnownStatus::failed()),
    ("BOOT_FAIL", KnownStatus::failed()),
    ("DEADLINE", KnownStatus::failed()),
];

/// Busca un código en la tabla. Los desconocidos no son terminales ni fallas:
/// se sigue consultando.
pub fn lookup_status(code: &str) -> KnownStatus {
    KNOWN_STATUSES
        .iter()
        .find(|(name, _)| *name == code)
        .map(|(_, status)| *status)
        .unwrap_or(KnownStatus::pending())
}

impl RemoteTaskStatus {
    pub fn known(&self) -> KnownStatus {
        lookup_status(&self.status_code)
    }

    pub fn is_terminal(&self) -> bool {
        self.known().terminal
    }

    pub fn is_failure(&self) -> bool {
        self.known().failure
    }
}

/// Interpreta la salida de `sacct --format JobID%30,JobName%30,State -j <id>`.
///
/// Sólo se consideran las filas `<id>_<índice>`; los pasos (`<id>_0.batch`),
/// los rangos pendientes (`<id>_[2-5]`) y las cabeceras se ignoran. Un `+`
/// final en el estado (estado truncado) se descarta.
pub fn parse_accounting_output(output: &str, remote_job_id: &str) -> Vec<RemoteTaskStatus> {
    let prefix = format!("{remote_job_id}_");
    let mut statuses = Vec::new();

    for line in output.lines() {
        let columns: Vec<&str> = line.split_whitespace().collect();
        if columns.len() < 3 {
            continue;
        }
        let Some(index) = columns[0].strip_prefix(&prefix) else {
            continue;
        };
        let Ok(task_index) = index.parse::<usize>() else {
            continue;
        };
        let status_code = columns[2].trim_end_matches('+').to_string();
        statuses.push(RemoteTaskStatus {
            status_code,
            task_index,
        });
    }

    statuses
}

/// Extrae el id del job de la salida de `sbatch`. `None` si no aparece el token.
pub fn parse_submission_output(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (_, rest) = line.split_once(SUBMISSION_TOKEN)?;
        rest.split_whitespace().next().map(str::to_string)
    })
}
