use std::sync::Arc;

use crate::config::Config;
use crate::payload::PayloadDir;
use crate::store::RetentionStore;

pub struct AppState {
    pub config: Config,
    pub store: Arc<RetentionStore>,
    pub payloads: PayloadDir,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let store = Arc::new(RetentionStore::new(
            config.data_file.clone(),
            config.max_images,
            config.lifetime(),
        ));
        let payloads = PayloadDir::new(config.upload_dir.clone());
        Self {
            config,
            store,
            payloads,
        }
    }
}
