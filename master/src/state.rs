use std::sync::Arc;

use crate::config::MasterConfig;
use crate::executor::JobExecutorService;
use crate::logging::JobLogRegistry;
use crate::store::JobStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub executor: JobExecutorService,
    // líneas de los jobs que todavía no volcaron joblog.txt
    pub logs: JobLogRegistry,
    pub config: Arc<MasterConfig>,
}
