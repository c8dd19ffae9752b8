//! Cluster en memoria para tests: sistema de archivos remoto, respuestas
//! programadas de sbatch/sacct y fallos inyectables.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;

use super::shell::{CommandOutput, RemoteConnector, RemoteEntry, RemoteShell};
use crate::config::ClusterConfig;
use crate::error::RemoteError;

pub const FAKE_HOME: &str = "/home/noise";

#[derive(Default)]
struct FakeState {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    commands: Vec<String>,
    submit_answer: String,
    accounting: VecDeque<String>,
    /// Archivos que aparecen en el cluster cuando se envía el array
    outputs_on_submit: Vec<(String, Vec<u8>)>,
    connect_failures: u32,
    put_failures: u32,
    exec_drops: u32,
    /// sacct no responde nunca
    hang_accounting: bool,
    connects: usize,
}

#[derive(Clone)]
pub struct FakeCluster {
    state: Arc<Mutex<FakeState>>,
}

fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(parent, _)| parent)
}

impl FakeCluster {
    pub fn new() -> Self {
        let cluster = Self {
            state: Arc::new(Mutex::new(FakeState {
                submit_answer: "Submitted batch job 1\n".to_string(),
                ..Default::default()
            })),
        };
        cluster.mkdir_all(FAKE_HOME);
        cluster
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn mkdir_all(&self, path: &str) {
        let mut state = self.lock();
        let mut current = path.trim_end_matches('/');
        while !current.is_empty() {
            state.dirs.insert(current.to_string());
            current = parent_of(current);
        }
    }

    pub fn write_file(&self, path: &str, bytes: &[u8]) {
        self.lock().files.insert(path.to_string(), bytes.to_vec());
    }

    pub fn append_file(&self, path: &str, bytes: &[u8]) {
        self.lock()
            .files
            .entry(path.to_string())
            .or_default()
            .extend_from_slice(bytes);
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.lock().files.contains_key(path)
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.lock().dirs.contains(path)
    }

    pub fn set_submit_answer(&self, answer: &str) {
        self.lock().submit_answer = answer.to_string();
    }

    /// Respuestas de sacct en orden; la última se repite.
    pub fn push_accounting(&self, answer: &str) {
        self.lock().accounting.push_back(answer.to_string());
    }

    pub fn output_on_submit(&self, path: &str, bytes: &[u8]) {
        self.lock()
            .outputs_on_submit
            .push((path.to_string(), bytes.to_vec()));
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.lock().connect_failures = n;
    }

    pub fn fail_next_puts(&self, n: u32) {
        self.lock().put_failures = n;
    }

    pub fn drop_next_execs(&self, n: u32) {
        self.lock().exec_drops = n;
    }

    pub fn hang_accounting(&self) {
        self.lock().hang_accounting = true;
    }

    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }
}

fn lost(what: &str) -> RemoteError {
    RemoteError::Connection {
        host: "fake".to_string(),
        message: format!("conexión perdida durante {what}"),
    }
}

#[async_trait]
impl RemoteConnector for FakeCluster {
    async fn connect(&self, _config: &ClusterConfig) -> Result<Box<dyn RemoteShell>, RemoteError> {
        let mut state = self.lock();
        state.connects += 1;
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(lost("connect"));
        }
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl RemoteShell for FakeCluster {
    async fn exec(&self, command: &str) -> Result<CommandOutput, RemoteError> {
        let hang = command.starts_with("sacct") && self.lock().hang_accounting;
        if hang {
            self.lock().commands.push(command.to_string());
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        let mut state = self.lock();
        if state.exec_drops > 0 {
            state.exec_drops -= 1;
            return Err(lost(command));
        }
        state.commands.push(command.to_string());

        let stdout = if command.contains("sbatch") {
            let outputs = std::mem::take(&mut state.outputs_on_submit);
            for (path, bytes) in outputs {
                let mut dir = parent_of(&path).to_string();
                while !dir.is_empty() {
                    state.dirs.insert(dir.clone());
                    dir = parent_of(&dir).to_string();
                }
                state.files.insert(path, bytes);
            }
            state.submit_answer.clone()
        } else if command.starts_with("sacct") {
            if state.accounting.len() > 1 {
                state.accounting.pop_front().unwrap_or_default()
            } else {
                state.accounting.front().cloned().unwrap_or_default()
            }
        } else {
            String::new()
        };

        Ok(CommandOutput {
            status: Some(0),
            stdout: stdout.into_bytes(),
            stderr: String::new(),
        })
    }

    async fn dir_exists(&self, path: &str) -> Result<bool, RemoteError> {
        Ok(self.has_dir(path))
    }

    async fn mkdir(&self, path: &str) -> Result<(), RemoteError> {
        self.mkdir_all(path);
        Ok(())
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let state = self.lock();
        let mut entries: Vec<RemoteEntry> = state
            .dirs
            .iter()
            .filter(|d| parent_of(d) == path)
            .map(|d| RemoteEntry {
                name: d[path.len() + 1..].to_string(),
                size: 4096,
                is_dir: true,
            })
            .collect();
        entries.extend(
            state
                .files
                .iter()
                .filter(|(f, _)| parent_of(f) == path)
                .map(|(f, bytes)| RemoteEntry {
                    name: f[path.len() + 1..].to_string(),
                    size: bytes.len() as u64,
                    is_dir: false,
                }),
        );
        Ok(entries)
    }

    async fn read_from(&self, path: &str, offset: u64) -> Result<Vec<u8>, RemoteError> {
        let state = self.lock();
        let bytes = state.files.get(path).ok_or_else(|| RemoteError::CommandFailed {
            command: format!("tail {path}"),
            status: Some(1),
            stderr: "no such file".to_string(),
        })?;
        let start = (offset as usize).min(bytes.len());
        Ok(bytes[start..].to_vec())
    }

    async fn put_file(&self, local: &Path, remote: &str) -> Result<(), RemoteError> {
        let bytes = std::fs::read(local).map_err(|source| RemoteError::LocalIo {
            path: local.to_path_buf(),
            source,
        })?;
        let mut state = self.lock();
        if state.put_failures > 0 {
            state.put_failures -= 1;
            return Err(RemoteError::Transfer {
                path: remote.to_string(),
                message: "scp interrumpido".to_string(),
            });
        }
        if !state.dirs.contains(parent_of(remote)) {
            return Err(RemoteError::CommandFailed {
                command: format!("scp {remote}"),
                status: Some(1),
                stderr: "No such file or directory".to_string(),
            });
        }
        state.files.insert(remote.to_string(), bytes);
        Ok(())
    }

    async fn get_file(&self, remote: &str, local: &Path) -> Result<(), RemoteError> {
        let bytes = self
            .lock()
            .files
            .get(remote)
            .cloned()
            .ok_or_else(|| RemoteError::Transfer {
                path: remote.to_string(),
                message: "no existe".to_string(),
            })?;
        std::fs::write(local, bytes).map_err(|source| RemoteError::LocalIo {
            path: local.to_path_buf(),
            source,
        })
    }

    async fn remove_dir_all(&self, path: &str) -> Result<(), RemoteError> {
        let prefix = format!("{path}/");
        let mut state = self.lock();
        state.commands.push(format!("rm -rf {path}"));
        state.files.retain(|f, _| !f.starts_with(&prefix));
        state.dirs.retain(|d| d != path && !d.starts_with(&prefix));
        Ok(())
    }

    async fn home_dir(&self) -> Result<String, RemoteError> {
        Ok(FAKE_HOME.to_string())
    }
}
