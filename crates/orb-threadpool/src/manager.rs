//! Registry of named thread pools with a default pool

use crate::error::{Result, ThreadPoolError};
use crate::thread_pool::{ThreadPool, ThreadPoolConfig};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::info;

/// Owns every thread pool of an ORB.
pub struct ThreadPoolManager {
    pools: RwLock<HashMap<String, ThreadPool>>,
    default_name: String,
}

impl ThreadPoolManager {
    /// Create a manager whose default pool is built from `default_config`.
    pub fn new(default_config: ThreadPoolConfig) -> Result<Self> {
        let default_name = default_config.name.clone();
        let pool = ThreadPool::new(default_config)?;
        let mut pools = HashMap::new();
        pools.insert(default_name.clone(), pool);
        Ok(Self {
            pools: RwLock::new(pools),
            default_name,
        })
    }

    pub fn default_pool(&self) -> ThreadPool {
        // The default pool is inserted at construction and never removed.
        self.pools.read()[&self.default_name].clone()
    }

    pub fn get_thread_pool(&self, name: &str) -> Result<ThreadPool> {
        self.pools
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ThreadPoolError::NoSuchThreadPool(name.to_string()))
    }

    /// Create and register another pool.
    pub fn add_thread_pool(&self, config: ThreadPoolConfig) -> Result<ThreadPool> {
        let mut pools = self.pools.write();
        if pools.contains_key(&config.name) {
            return Err(ThreadPoolError::IllegalState(format!(
                "thread pool {} already exists",
                config.name
            )));
        }
        let name = config.name.clone();
        let pool = ThreadPool::new(config)?;
        pools.insert(name, pool.clone());
        Ok(pool)
    }

    pub fn pool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Close every pool.
    pub fn close(&self) {
        let pools: Vec<ThreadPool> = self.pools.read().values().cloned().collect();
        for pool in pools {
            pool.close();
        }
        info!("all thread pools closed");
    }
}
