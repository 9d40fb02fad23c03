use crate::config::WatchSettings;
use crate::pipeline::{BoxError, ProcessService};
use async_trait::async_trait;
use procstore_core::engine::IngestAck;
use procstore_core::query::{QueryDescriptor, ResultSet};
use procstore_core::record::ProcessSample;
use procstore_core::Engine;
use std::sync::Arc;

/// [`ProcessService`] backed by an in-process procstore engine.
pub struct ProcessServiceImpl {
    engine: Arc<Engine>,
}

impl ProcessServiceImpl {
    /// Opens the configured store and cache and starts the engine's
    /// background tasks.
    pub async fn new(settings: &WatchSettings) -> Result<Self, BoxError> {
        let engine = Engine::from_settings(&settings.engine_settings()).await?;
        engine.start();
        Ok(Self::from_engine(Arc::new(engine)))
    }

    pub fn from_engine(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }
}

#[async_trait]
impl ProcessService for ProcessServiceImpl {
    async fn ingest(&self, sample: ProcessSample) -> Result<IngestAck, BoxError> {
        Ok(self.engine.ingest(sample).await?)
    }

    async fn query(&self, descriptor: QueryDescriptor) -> Result<ResultSet, BoxError> {
        Ok(self.engine.query(&descriptor).await?)
    }
}
