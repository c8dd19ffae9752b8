pub mod error;
pub mod job;
pub mod merge;
pub mod partition;
pub mod results;
pub mod task;

pub use error::{MergeError, PartitionError};
pub use job::{new_job_id, ClusterConnection, JobId, JobInfo, JobRequest, JobState};
pub use partition::{partition, PartitionConfig, Partition, WorkUnit};
pub use results::{CancelResponse, JobLogsResponse, JobResults, ResultFile};
pub use task::RemoteTaskStatus;

/* --------- Nombres fijos del directorio de trabajo --------- */

/// Outputs parciales traídos del cluster (o escritos por el cálculo local)
pub const RESULTS_DIR: &str = "results";
/// Tablas fusionadas
pub const RESULTS_POST_DIR: &str = "results_post";
/// Log persistido de cada job
pub const JOB_LOG_FILE: &str = "joblog.txt";
