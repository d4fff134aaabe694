use std::sync::Arc;

use common::{
    storage::{
        db::SurrealDbClient,
        types::job::{JobStore, JobSubmitter},
        vector_store::VectorStore,
    },
    utils::config::AppConfig,
};

#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<SurrealDbClient>,
    pub config: AppConfig,
    pub job_store: JobStore,
    pub submitter: Arc<dyn JobSubmitter>,
    pub vector_store: Arc<dyn VectorStore>,
}

impl ApiState {
    pub fn new(
        db: Arc<SurrealDbClient>,
        config: AppConfig,
        submitter: Arc<dyn JobSubmitter>,
        vector_store: Arc<dyn VectorStore>,
    ) -> Self {
        let job_store = JobStore::new(Arc::clone(&db));

        Self {
            db,
            config,
            job_store,
            submitter,
            vector_store,
        }
    }
}
