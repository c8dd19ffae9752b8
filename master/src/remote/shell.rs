use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::{debug, warn};

use crate::config::ClusterConfig;
use crate::error::{RemoteError, SSH_TRANSPORT_EXIT_CODE};

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }
}

/// Entrada de un directorio remoto.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
}

/// Sesión con el cluster: comandos y transferencia de archivos.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Ejecuta un comando; un código de salida distinto de 0 no es error acá.
    async fn exec(&self, command: &str) -> Result<CommandOutput, RemoteError>;
    async fn dir_exists(&self, path: &str) -> Result<bool, RemoteError>;
    async fn mkdir(&self, path: &str) -> Result<(), RemoteError>;
    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError>;
    /// Bytes del archivo a partir de `offset` (0 = desde el principio).
    async fn read_from(&self, path: &str, offset: u64) -> Result<Vec<u8>, RemoteError>;
    async fn put_file(&self, local: &Path, remote: &str) -> Result<(), RemoteError>;
    async fn get_file(&self, remote: &str, local: &Path) -> Result<(), RemoteError>;
    async fn remove_dir_all(&self, path: &str) -> Result<(), RemoteError>;
    async fn home_dir(&self) -> Result<String, RemoteError>;
}

#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self, config: &ClusterConfig) -> Result<Box<dyn RemoteShell>, RemoteError>;
}

/// Comillas simples para el shell remoto.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

pub fn remote_join(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), name)
    }
}

/* ---------------- OpenSSH ---------------- */

/// Usa los binarios `ssh`, `scp` y `ssh-keyscan` del sistema.
pub struct OpenSshConnector {
    /// Donde se escriben los known_hosts generados desde la configuración
    known_hosts_dir: PathBuf,
}

impl OpenSshConnector {
    pub fn new(known_hosts_dir: impl Into<PathBuf>) -> Self {
        Self {
            known_hosts_dir: known_hosts_dir.into(),
        }
    }

    fn known_host_name(config: &ClusterConfig) -> String {
        if config.port == 22 {
            config.host.clone()
        } else {
            format!("[{}]:{}", config.host, config.port)
        }
    }

    /// Huellas SHA256 de las claves que presenta el host, para que un
    /// operador las compare antes de configurar `host_key`.
    async fn report_presented_keys(config: &ClusterConfig) -> String {
        let scan = Command::new("ssh-keyscan")
            .arg("-p")
            .arg(config.port.to_string())
            .arg(&config.host)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await;
        let scanned = match scan {
            Ok(out) => out.stdout,
            Err(e) => {
                warn!(host = %config.host, error = %e, "no se pudo ejecutar ssh-keyscan");
                return String::new();
            }
        };
        if scanned.iter().all(u8::is_ascii_whitespace) {
            warn!(host = %config.host, "ssh-keyscan no devolvió claves");
            return String::new();
        }

        let fingerprints = match fingerprint_keys(&scanned).await {
            Ok(text) => parse_fingerprints(&text),
            Err(e) => {
                warn!(host = %config.host, error = %e, "no se pudo ejecutar ssh-keygen");
                return String::new();
            }
        };
        for fp in &fingerprints {
            warn!(
                host = %config.host,
                key_type = %fp.key_type,
                fingerprint = %fp.hash,
                "clave presentada por un host sin configurar"
            );
        }
        fingerprints
            .iter()
            .map(|fp| format!("{} {}", fp.key_type, fp.hash))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Pasa la salida de ssh-keyscan por `ssh-keygen -lf -`.
async fn fingerprint_keys(scanned: &[u8]) -> std::io::Result<String> {
    let mut child = Command::new("ssh-keygen")
        .args(["-l", "-E", "sha256", "-f", "-"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(scanned).await?;
    }
    let output = child.wait_with_output().await?;
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct KeyFingerprint {
    key_type: String,
    hash: String,
}

/// Líneas `256 SHA256:xxxx host (ED25519)` de ssh-keygen.
fn parse_fingerprints(text: &str) -> Vec<KeyFingerprint> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let _bits = parts.next()?;
            let hash = parts.next().filter(|h| h.starts_with("SHA256:"))?;
            let key_type = parts
                .last()
                .and_then(|t| t.strip_prefix('(')?.strip_suffix(')'))
                .unwrap_or("?");
            Some(KeyFingerprint {
                key_type: key_type.to_string(),
                hash: hash.to_string(),
            })
        })
        .collect()
}

#[async_trait]
impl RemoteConnector for OpenSshConnector {
    async fn connect(&self, config: &ClusterConfig) -> Result<Box<dyn RemoteShell>, RemoteError> {
        let (Some(key_type), Some(key)) = (&config.host_key_type, &config.host_key) else {
            let presented = Self::report_presented_keys(config).await;
            return Err(RemoteError::UntrustedHost {
                host: config.host.clone(),
                presented,
            });
        };

        tokio::fs::create_dir_all(&self.known_hosts_dir)
            .await
            .map_err(|source| RemoteError::LocalIo {
                path: self.known_hosts_dir.clone(),
                source,
            })?;
        let known_hosts = self
            .known_hosts_dir
            .join(format!("known_hosts_{}_{}", config.host, config.port));
        let line = format!("{} {} {}\n", Self::known_host_name(config), key_type, key);
        tokio::fs::write(&known_hosts, line)
            .await
            .map_err(|source| RemoteError::LocalIo {
                path: known_hosts.clone(),
                source,
            })?;

        let shell = OpenSshShell::new(config, known_hosts);
        match shell.run_ssh("true").await {
            Ok(_) => Ok(Box::new(shell)),
            Err(RemoteError::Connection { message, .. })
                if message.contains("Host key verification failed") =>
            {
                let presented = Self::report_presented_keys(config).await;
                Err(RemoteError::UntrustedHost {
                    host: config.host.clone(),
                    presented,
                })
            }
            Err(e) => Err(e),
        }
    }
}

pub struct OpenSshShell {
    host: String,
    destination: String,
    port: u16,
    options: Vec<String>,
}

impl OpenSshShell {
    fn new(config: &ClusterConfig, known_hosts: PathBuf) -> Self {
        let mut options = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=yes".to_string(),
            "-o".to_string(),
            format!("UserKnownHostsFile={}", known_hosts.display()),
            "-o".to_string(),
            format!("ConnectTimeout={}", config.connect_timeout_secs),
        ];
        if !config.identity_file.is_empty() {
            options.push("-i".to_string());
            options.push(config.identity_file.clone());
        }
        Self {
            host: config.host.clone(),
            destination: config.destination(),
            port: config.port,
            options,
        }
    }

    async fn output(&self, mut cmd: Command, program: &str) -> Result<CommandOutput, RemoteError> {
        let out = cmd
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| RemoteError::Spawn {
                program: program.to_string(),
                source,
            })?;
        let output = CommandOutput {
            status: out.status.code(),
            stdout: out.stdout,
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        };
        if output.status == Some(SSH_TRANSPORT_EXIT_CODE) || output.status.is_none() {
            return Err(RemoteError::Connection {
                host: self.host.clone(),
                message: output.stderr,
            });
        }
        Ok(output)
    }

    async fn run_ssh(&self, remote_command: &str) -> Result<CommandOutput, RemoteError> {
        debug!(host = %self.host, command = remote_command, "ssh");
        let mut cmd = Command::new("ssh");
        cmd.arg("-p")
            .arg(self.port.to_string())
            .args(&self.options)
            .arg(&self.destination)
            .arg(remote_command);
        self.output(cmd, "ssh").await
    }

    async fn run_checked(&self, remote_command: &str) -> Result<CommandOutput, RemoteError> {
        let output = self.run_ssh(remote_command).await?;
        if !output.success() {
            return Err(RemoteError::CommandFailed {
                command: remote_command.to_string(),
                status: output.status,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }

    async fn scp(&self, from: String, to: String, shown: &str) -> Result<(), RemoteError> {
        let mut cmd = Command::new("scp");
        cmd.arg("-q")
            .arg("-P")
            .arg(self.port.to_string())
            .args(&self.options)
            .arg(from)
            .arg(to);
        match self.output(cmd, "scp").await {
            Ok(out) if out.success() => Ok(()),
            Ok(out) => Err(RemoteError::Transfer {
                path: shown.to_string(),
                message: out.stderr,
            }),
            Err(RemoteError::Connection { message, .. }) => Err(RemoteError::Transfer {
                path: shown.to_string(),
                message,
            }),
            Err(e) => Err(e),
        }
    }
}

fn parse_find_listing(text: &str) -> Vec<RemoteEntry> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, ',');
            let kind = parts.next()?;
            let size = parts.next()?.parse().ok()?;
            let name = parts.next()?.to_string();
            Some(RemoteEntry {
                name,
                size,
                is_dir: kind == "d",
            })
        })
        .collect()
}

#[async_trait]
impl RemoteShell for OpenSshShell {
    async fn exec(&self, command: &str) -> Result<CommandOutput, RemoteError> {
        self.run_ssh(command).await
    }

    async fn dir_exists(&self, path: &str) -> Result<bool, RemoteError> {
        let out = self.run_ssh(&format!("test -d {}", shell_quote(path))).await?;
        Ok(out.success())
    }

    async fn mkdir(&self, path: &str) -> Result<(), RemoteError> {
        self.run_checked(&format!("mkdir -p {}", shell_quote(path)))
            .await
            .map(|_| ())
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let out = self
            .run_checked(&format!(
                "find {} -mindepth 1 -maxdepth 1 -printf '%y,%s,%f\\n'",
                shell_quote(path)
            ))
            .await?;
        Ok(parse_find_listing(&out.stdout_text()))
    }

    async fn read_from(&self, path: &str, offset: u64) -> Result<Vec<u8>, RemoteError> {
        let out = self
            .run_checked(&format!("tail -c +{} {}", offset + 1, shell_quote(path)))
            .await?;
        Ok(out.stdout)
    }

    async fn put_file(&self, local: &Path, remote: &str) -> Result<(), RemoteError> {
        self.scp(
            local.display().to_string(),
            format!("{}:{}", self.destination, remote),
            remote,
        )
        .await
    }

    async fn get_file(&self, remote: &str, local: &Path) -> Result<(), RemoteError> {
        self.scp(
            format!("{}:{}", self.destination, remote),
            local.display().to_string(),
            remote,
        )
        .await
    }

    async fn remove_dir_all(&self, path: &str) -> Result<(), RemoteError> {
        self.run_checked(&format!("rm -rf {}", shell_quote(path)))
            .await
            .map(|_| ())
    }

    async fn home_dir(&self) -> Result<String, RemoteError> {
        let out = self.run_checked("printf '%s' \"$HOME\"").await?;
        Ok(out.stdout_text().trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comillas_para_el_shell_remoto() {
        assert_eq!(shell_quote("results_42"), "'results_42'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn listado_de_find() {
        let entries = parse_find_listing("f,120,slurm-1_0.out\nd,4096,lib\nbasura\n");
        assert_eq!(
            entries,
            vec![
                RemoteEntry {
                    name: "slurm-1_0.out".into(),
                    size: 120,
                    is_dir: false
                },
                RemoteEntry {
                    name: "lib".into(),
                    size: 4096,
                    is_dir: true
                },
            ]
        );
    }

    #[test]
    fn rutas_remotas() {
        assert_eq!(remote_join("/home/u/", "job_1"), "/home/u/job_1");
        assert_eq!(remote_join("", "job_1"), "job_1");
    }

    #[test]
    fn huellas_de_ssh_keygen() {
        let text = "256 SHA256:n8X1JbQ2ZkS0v3tR7m0aPp9cXwq/BDlU+2fq1E8rY4o cluster.example (ED25519)\n\
                    3072 SHA256:Qm7yXz1lQ0R9pS3vK2a8b6c4d1e0f9g8h7i6j5k4l3m cluster.example (RSA)\n\
                    cluster.example: no se pudo leer\n";
        assert_eq!(
            parse_fingerprints(text),
            vec![
                KeyFingerprint {
                    key_type: "ED25519".into(),
                    hash: "SHA256:n8X1JbQ2ZkS0v3tR7m0aPp9cXwq/BDlU+2fq1E8rY4o".into(),
                },
                KeyFingerprint {
                    key_type: "RSA".into(),
                    hash: "SHA256:Qm7yXz1lQ0R9pS3vK2a8b6c4d1e0f9g8h7i6j5k4l3m".into(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn sin_clave_de_confianza_no_se_conecta() {
        let dir = tempfile::tempdir().unwrap();
        let connector = OpenSshConnector::new(dir.path());
        let config = ClusterConfig {
            host: "127.0.0.1".into(),
            port: 1,
            user: "nadie".into(),
            ..Default::default()
        };
        let err = connector.connect(&config).await.err().unwrap();
        assert!(matches!(err, RemoteError::UntrustedHost { .. }));
    }
}
