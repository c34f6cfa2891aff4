//! Queue registry - named queues shared by every client

use super::executor::ProcessExecutor;
use super::hook::PostHandlerInvoker;
use super::queue::Queue;
use super::store::FinishedStore;
use crate::config::Config;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// What every queue needs to run tasks
pub struct EngineContext {
    pub config: Config,
    pub executor: ProcessExecutor,
    pub post_handler: PostHandlerInvoker,
}

impl EngineContext {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            executor: ProcessExecutor::new(),
            post_handler: PostHandlerInvoker::default(),
        }
    }

    pub fn with_post_handler(mut self, post_handler: PostHandlerInvoker) -> Self {
        self.post_handler = post_handler;
        self
    }

    /// Where a queue's finished record lives, if records are kept at all
    pub fn record_path(&self, queue: &str) -> Option<PathBuf> {
        self.config
            .persist_finished
            .then(|| FinishedStore::record_path_for(&self.config.save_path, queue))
    }
}

/// Name -> queue map
pub struct QueueRegistry {
    ctx: Arc<EngineContext>,
    queues: RwLock<BTreeMap<String, Queue>>,
}

impl QueueRegistry {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            queues: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn create(&self, name: &str) -> Result<()> {
        validate_name(name)?;

        let mut queues = self.queues.write();
        if queues.contains_key(name) {
            return Err(Error::AlreadyExists(format!("queue already exists: {}", name)));
        }
        let queue = Queue::new(name, self.ctx.clone())?;
        queues.insert(name.to_string(), queue);

        log::info!("Created queue {}", name);
        Ok(())
    }

    /// Delete an idle queue. Pending tasks are dropped with it.
    pub fn remove(&self, name: &str) -> Result<()> {
        let (queue, update) = {
            let mut queues = self.queues.write();
            let queue = queues.get(name).ok_or_else(|| Error::no_such_queue(name))?;
            let update = queue.try_shutdown()?;
            let queue = queues.remove(name).ok_or_else(|| Error::no_such_queue(name))?;
            (queue, update)
        };
        queue.persist(update);

        log::info!("Deleted queue {}", name);
        Ok(())
    }

    /// Rename in one step; no observer sees both names or neither.
    /// The finished record file follows once the map is unlocked.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        validate_name(new)?;

        let (queue, update) = {
            let mut queues = self.queues.write();
            if queues.contains_key(new) {
                return Err(Error::AlreadyExists(format!("queue already exists: {}", new)));
            }
            let queue = queues.remove(old).ok_or_else(|| Error::no_such_queue(old))?;
            let update = queue.set_name(new);
            queues.insert(new.to_string(), queue.clone());
            (queue, update)
        };
        queue.persist(update);

        log::info!("Renamed queue {} -> {}", old, new);
        Ok(())
    }

    /// Queue names in sorted order
    pub fn list(&self) -> Vec<String> {
        self.queues.read().keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Result<Queue> {
        self.queues
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::no_such_queue(name))
    }

    /// Stop every worker; running tasks finish, pending ones are dropped
    pub fn shutdown(&self) {
        let queues = std::mem::take(&mut *self.queues.write());
        for (name, queue) in queues {
            log::debug!("Stopping queue {}", name);
            queue.shutdown();
        }
    }
}

/// Queue names end up in file names
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::ValidationFailed("queue name is empty".into()));
    }
    if name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(Error::ValidationFailed(format!("invalid queue name: {}", name)));
    }
    Ok(())
}
