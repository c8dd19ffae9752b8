use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use common::merge::{GridSpec, MergeSettings, ResultNaming};
use common::ClusterConnection;
use serde::Deserialize;

use crate::error::ConfigError;

/* --------- Secciones --------- */

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Un directorio de trabajo por job debajo de éste
    pub jobs_dir: PathBuf,
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            jobs_dir: PathBuf::from("data/jobs"),
            database_path: PathBuf::from("data/jobs.sqlite"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub max_concurrent_jobs: usize,
    /// Espera entre la cancelación cooperativa y el abort forzado
    pub abort_delay_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            abort_delay_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    pub progress_update_interval_ms: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            progress_update_interval_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_dir: String,
    pub log_file: String,
    /// Líneas que se guardan por job para joblog.txt
    pub job_log_capacity: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".into(),
            log_file: "master.log".into(),
            job_log_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    /// Programa externo que ejecuta los scripts de cálculo
    pub program: String,
    /// Binarios que se copian al cluster
    pub lib_dir: PathBuf,
    /// Script sbatch del array de tareas
    pub batch_script: PathBuf,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            program: "noisemodelling".into(),
            lib_dir: PathBuf::from("lib"),
            batch_script: PathBuf::from("scripts/run_partition.sh"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub cell_size: f64,
    pub main_cell_size: f64,
    pub classification_field: String,
    pub result_prefix: String,
    pub result_separator: String,
    /// Si viene, sólo estas tablas CSV se fusionan
    pub csv_tables: Option<Vec<String>>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            cell_size: 10.0,
            main_cell_size: 800.0,
            classification_field: "NOISELEVEL".into(),
            result_prefix: "out_".into(),
            result_separator: "_".into(),
            csv_tables: None,
        }
    }
}

impl MergeConfig {
    pub fn naming(&self) -> ResultNaming {
        ResultNaming {
            prefix: self.result_prefix.clone(),
            separator: self.result_separator.clone(),
        }
    }

    pub fn settings(&self) -> Result<MergeSettings, ConfigError> {
        let grid = GridSpec::new(self.cell_size, self.main_cell_size)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(MergeSettings {
            grid,
            classification_field: self.classification_field.clone(),
            naming: self.naming(),
            csv_tables: self.csv_tables.clone(),
        })
    }
}

/// Pool de unidades de trabajo: un extracto GeoJSON y su campo clave.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub category: String,
    pub file: String,
    #[serde(default = "default_key_field")]
    pub key_field: String,
    /// Si falta un extracto opcional, el pool queda vacío
    #[serde(default)]
    pub optional: bool,
}

fn default_key_field() -> String {
    "UUEID".into()
}

fn default_sources() -> Vec<SourceConfig> {
    vec![
        SourceConfig {
            category: "roads".into(),
            file: "ROADS.geojson".into(),
            key_field: default_key_field(),
            optional: false,
        },
        SourceConfig {
            category: "rails".into(),
            file: "LW_RAILWAY.geojson".into(),
            key_field: default_key_field(),
            optional: true,
        },
    ]
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub identity_file: String,
    /// Clave pública del host en la que confiamos (configurada fuera de banda)
    pub host_key_type: Option<String>,
    pub host_key: Option<String>,
    /// Tamaño máximo del array de tareas
    pub max_jobs: usize,
    /// Relativo al home remoto si no es absoluto
    pub remote_root: String,
    pub poll_interval_secs: u64,
    pub min_poll_sleep_secs: u64,
    pub max_connection_retries: u32,
    pub max_transfer_retries: u32,
    pub retry_delay_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            user: String::new(),
            identity_file: String::new(),
            host_key_type: None,
            host_key: None,
            max_jobs: 32,
            remote_root: "noise_jobs".into(),
            poll_interval_secs: 40,
            min_poll_sleep_secs: 1,
            max_connection_retries: 170,
            max_transfer_retries: 4,
            retry_delay_secs: 40,
            connect_timeout_secs: 60,
        }
    }
}

impl ClusterConfig {
    /// La conexión enviada con el job reemplaza la del master; los tiempos y
    /// reintentos se heredan.
    pub fn resolve(
        default: Option<&ClusterConfig>,
        request: Option<&ClusterConnection>,
    ) -> Option<ClusterConfig> {
        match (default, request) {
            (base, Some(conn)) => {
                let mut config = base.cloned().unwrap_or_default();
                config.host = conn.host.clone();
                config.port = conn.port;
                config.user = conn.user.clone();
                config.identity_file = conn.identity_file.clone();
                config.host_key_type = conn.host_key_type.clone();
                config.host_key = conn.host_key.clone();
                Some(config)
            }
            (Some(base), None) => Some(base.clone()),
            (None, None) => None,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn min_poll_sleep(&self) -> Duration {
        Duration::from_secs(self.min_poll_sleep_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/* --------- Configuración completa --------- */

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub executor: ExecutorConfig,
    pub progress: ProgressConfig,
    pub logging: LoggingConfig,
    pub compute: ComputeConfig,
    pub merge: MergeConfig,
    pub sources: Vec<SourceConfig>,
    pub cluster: Option<ClusterConfig>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            executor: ExecutorConfig::default(),
            progress: ProgressConfig::default(),
            logging: LoggingConfig::default(),
            compute: ComputeConfig::default(),
            merge: MergeConfig::default(),
            sources: default_sources(),
            cluster: None,
        }
    }
}

impl MasterConfig {
    /// Lee `MASTER_CONFIG` (si está definido), aplica las variables de entorno y valida.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match env::var("MASTER_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("MASTER_LISTEN_ADDR") {
            self.server.listen_addr = addr;
        }
        if let Some(value) = lookup("MAX_CONCURRENT_JOBS") {
            self.executor.max_concurrent_jobs =
                value.parse().map_err(|_| ConfigError::InvalidEnv {
                    var: "MAX_CONCURRENT_JOBS".into(),
                    value: value.clone(),
                })?;
        }
        if let Some(dir) = lookup("JOBS_DIR") {
            self.storage.jobs_dir = PathBuf::from(dir);
        }
        if let Some(db) = lookup("JOBS_DATABASE") {
            self.storage.database_path = PathBuf::from(db);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.executor.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_jobs debe ser al menos 1".into(),
            ));
        }
        self.merge.settings()?;
        if let Some(cluster) = &self.cluster {
            if cluster.max_jobs == 0 {
                return Err(ConfigError::Invalid(
                    "cluster.max_jobs debe ser al menos 1".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn abort_delay(&self) -> Duration {
        Duration::from_secs(self.executor.abort_delay_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress.progress_update_interval_ms)
    }
}
