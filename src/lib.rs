//! stq - Simple Task Queue
//!
//! Named queues of shell tasks, each queue running its tasks one at a
//! time in submission order, with live output streaming and post-run
//! plugins.

pub mod config;
pub mod core;
pub mod error;
pub mod server;
pub mod service;

// Re-exports
pub use config::Config;
pub use self::core::{
    EngineContext, OutputReader, Priority, Queue, QueueRegistry, Task, TaskSpec, TaskState,
    TaskSummary,
};
pub use error::{Error, ErrorKind, Result};
pub use server::Server;
pub use service::{AllowAll, Interceptor, Request, Response, Service};

use std::sync::Arc;

/// stq engine - main entry point for library usage
pub struct StqEngine {
    registry: Arc<QueueRegistry>,
}

impl StqEngine {
    /// Build an engine from a configuration, creating its directories
    pub fn new(config: Config) -> anyhow::Result<Self> {
        config.prepare_dirs()?;
        Ok(Self::with_context(EngineContext::new(config)))
    }

    /// Build an engine around a prepared context (custom hooks, tests)
    pub fn with_context(ctx: EngineContext) -> Self {
        Self {
            registry: Arc::new(QueueRegistry::new(ctx)),
        }
    }

    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    pub fn service(&self) -> Service {
        Service::new(self.registry.clone())
    }

    pub fn config(&self) -> &Config {
        &self.registry.context().config
    }

    /// Stop all queues; running tasks finish, pending ones are dropped
    pub fn shutdown(&self) {
        log::info!("Shutting down");
        self.registry.shutdown();
    }
}
