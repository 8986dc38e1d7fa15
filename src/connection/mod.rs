//! Connection management for MongoDB
//!
//! Establishes the client used by the MongoDB store backend, applies pool
//! settings from [`StoreConfig`], and verifies the server with a ping.

use mongodb::bson::doc;
use mongodb::{Client, Database, options::ClientOptions};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::{ExportError, Result, StorageError};

const CONNECT_ATTEMPTS: u32 = 3;

/// MongoDB connection manager
pub struct ConnectionManager {
    /// MongoDB client instance
    client: Option<Client>,

    /// Store configuration
    config: StoreConfig,

    /// Current connection state
    state: Arc<RwLock<ConnectionState>>,
}

/// Connection state information
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed(String),
}

/// Health check result
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub is_healthy: bool,
    pub response_time_ms: u64,
}

impl ConnectionManager {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            client: None,
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
        }
    }

    /// Establish connection to MongoDB, retrying transient failures
    pub async fn connect(&mut self) -> Result<()> {
        self.set_state(ConnectionState::Connecting).await;

        let options = match ClientOptions::parse(&self.config.uri).await {
            Ok(options) => self.configure_pool(options),
            Err(e) => {
                self.set_state(ConnectionState::Failed(e.to_string())).await;
                return Err(e.into());
            }
        };

        let mut last_error = None;
        for attempt in 1..=CONNECT_ATTEMPTS {
            let client = Client::with_options(options.clone())?;
            match Self::ping(&client).await {
                Ok(()) => {
                    info!(database = %self.config.database, "connected to MongoDB");
                    self.client = Some(client);
                    self.set_state(ConnectionState::Connected).await;
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "MongoDB ping failed");
                    last_error = Some(e);
                    if attempt < CONNECT_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(250 * u64::from(attempt))).await;
                    }
                }
            }
        }

        let err = last_error
            .unwrap_or_else(|| StorageError::Unavailable("no connection attempt made".into()).into());
        self.set_state(ConnectionState::Failed(err.to_string())).await;
        Err(err)
    }

    /// Drop the client and its pooled connections
    pub async fn disconnect(&mut self) {
        if let Some(client) = self.client.take() {
            client.shutdown().await;
            debug!("disconnected from MongoDB");
        }
        self.set_state(ConnectionState::Disconnected).await;
    }

    /// Ping the server and time the round trip
    pub async fn health_check(&self) -> Result<HealthStatus> {
        let client = self.get_client()?;
        let started = Instant::now();
        let is_healthy = Self::ping(client).await.is_ok();
        Ok(HealthStatus {
            is_healthy,
            response_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Handle to the configured database
    pub fn database(&self) -> Result<Database> {
        Ok(self.get_client()?.database(&self.config.database))
    }

    pub fn get_client(&self) -> Result<&Client> {
        self.client.as_ref().ok_or_else(|| {
            ExportError::Storage(StorageError::Unavailable("not connected to MongoDB".into()))
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub async fn get_state(&self) -> ConnectionState {
        self.state.read().await.clone()
    }

    fn configure_pool(&self, mut options: ClientOptions) -> ClientOptions {
        options.max_pool_size = Some(self.config.max_pool_size);
        options.min_pool_size = Some(self.config.min_pool_size);
        options.connect_timeout = Some(Duration::from_secs(self.config.timeout));
        options.server_selection_timeout = Some(Duration::from_secs(self.config.timeout));
        options.app_name = Some("exportd".to_string());
        options
    }

    async fn set_state(&self, new_state: ConnectionState) {
        *self.state.write().await = new_state;
    }

    async fn ping(client: &Client) -> Result<()> {
        client.database("admin").run_command(doc! { "ping": 1 }).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_manager_is_disconnected() {
        let manager = ConnectionManager::new(StoreConfig::default());
        assert_eq!(manager.get_state().await, ConnectionState::Disconnected);
        assert!(manager.get_client().is_err());
        assert!(manager.database().is_err());
    }

    #[tokio::test]
    async fn test_invalid_uri_fails_connect() {
        let mut manager = ConnectionManager::new(StoreConfig {
            uri: "not-a-uri".to_string(),
            ..Default::default()
        });
        assert!(manager.connect().await.is_err());
        assert!(matches!(
            manager.get_state().await,
            ConnectionState::Failed(_)
        ));
    }
}
