use std::{path::Path, process::Stdio};

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ComputeError;

/// Scripts de la librería de cálculo que usa el pipeline.
pub mod scripts {
    pub const IMPORT: &str = "import";
    pub const RECEIVERS_GRID: &str = "receivers_grid";
    pub const EMISSION: &str = "emission";
    pub const NOISE_LEVEL: &str = "noise_level";
    pub const EXPORT: &str = "export";
}

/// Librería de cálculo externa, vista como caja negra: recibe un directorio de
/// trabajo y parámetros, deja tablas/archivos en ese directorio.
#[async_trait]
pub trait ComputeLibrary: Send + Sync {
    async fn exec(
        &self,
        script: &str,
        working_dir: &Path,
        params: &Value,
        cancel: &CancellationToken,
    ) -> Result<Value, ComputeError>;
}

/// Ejecuta `<program> <script> --working-dir <dir> --params <json>`.
pub struct ProcessComputeLibrary {
    program: String,
}

impl ProcessComputeLibrary {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl ComputeLibrary for ProcessComputeLibrary {
    async fn exec(
        &self,
        script: &str,
        working_dir: &Path,
        params: &Value,
        cancel: &CancellationToken,
    ) -> Result<Value, ComputeError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg(script)
            .arg("--working-dir")
            .arg(working_dir)
            .arg("--params")
            .arg(params.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(program = %self.program, script, "lanzando script de cálculo");
        let child = cmd.spawn().map_err(|source| ComputeError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        // si se cancela, soltar el future mata al proceso (kill_on_drop)
        let output = tokio::select! {
            out = child.wait_with_output() => out.map_err(|source| ComputeError::Spawn {
                program: self.program.clone(),
                source,
            })?,
            _ = cancel.cancelled() => return Err(ComputeError::Canceled),
        };

        if !output.status.success() {
            return Err(ComputeError::Failed {
                script: script.to_string(),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(stdout).unwrap_or_else(|_| Value::String(stdout.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::{fs, time::Duration};

    fn script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        path.to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn script_exitoso_devuelve_json() {
        let dir = tempfile::tempdir().unwrap();
        let import = script(
            dir.path(),
            "import.sh",
            "test \"$1\" = --working-dir || exit 9\necho '{\"rows\": 3}'\n",
        );

        let lib = ProcessComputeLibrary::new("sh");
        let out = lib
            .exec(&import, dir.path(), &json!({"dataset": "44"}), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, json!({"rows": 3}));
    }

    #[tokio::test]
    async fn script_fallido_reporta_codigo_y_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let failing = script(dir.path(), "fail.sh", "echo boom >&2\nexit 3\n");

        let lib = ProcessComputeLibrary::new("sh");
        let err = lib
            .exec(&failing, dir.path(), &json!({}), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ComputeError::Failed { status, stderr, .. } => {
                assert_eq!(status, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("error inesperado: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelacion_corta_el_proceso() {
        let dir = tempfile::tempdir().unwrap();
        let slow = script(dir.path(), "slow.sh", "sleep 30\n");

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let lib = ProcessComputeLibrary::new("sh");
        let started = std::time::Instant::now();
        let err = lib.exec(&slow, dir.path(), &json!({}), &cancel).await.unwrap_err();
        assert!(matches!(err, ComputeError::Canceled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
