// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

use crate::model::RunProjections;

/// Runtara Projections configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL or file path for the event log
    pub database_url: String,
    /// Number of worker queues projections are spread across
    pub worker_count: usize,
    /// Which projections are allowed to run
    pub run_projections: RunProjections,
    /// How long an unused transient projection survives
    pub query_expiry: Duration,
    /// Whether standard system projections are created on an empty registry
    pub initialize_system_projections: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `RUNTARA_PROJECTIONS_DATABASE_URL`: SQLite URL or path
    ///
    /// Optional (with defaults):
    /// - `RUNTARA_PROJECTIONS_WORKERS`: Worker queue count (default: 3)
    /// - `RUNTARA_PROJECTIONS_RUN`: `none`, `system` or `all` (default: system)
    /// - `RUNTARA_PROJECTIONS_QUERY_EXPIRY_SECS`: Transient TTL (default: 300)
    /// - `RUNTARA_PROJECTIONS_INIT_SYSTEM`: Create system projections (default: true)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("RUNTARA_PROJECTIONS_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("RUNTARA_PROJECTIONS_DATABASE_URL"))?;

        let worker_count: usize = std::env::var("RUNTARA_PROJECTIONS_WORKERS")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("RUNTARA_PROJECTIONS_WORKERS", "must be a positive integer")
            })?;
        if worker_count == 0 {
            return Err(ConfigError::Invalid(
                "RUNTARA_PROJECTIONS_WORKERS",
                "at least one worker is required",
            ));
        }

        let run_projections = std::env::var("RUNTARA_PROJECTIONS_RUN")
            .unwrap_or_else(|_| "system".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("RUNTARA_PROJECTIONS_RUN", "must be one of none, system, all")
            })?;

        let expiry_secs: u64 = std::env::var("RUNTARA_PROJECTIONS_QUERY_EXPIRY_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "RUNTARA_PROJECTIONS_QUERY_EXPIRY_SECS",
                    "must be a number of seconds",
                )
            })?;

        let initialize_system_projections: bool = std::env::var("RUNTARA_PROJECTIONS_INIT_SYSTEM")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("RUNTARA_PROJECTIONS_INIT_SYSTEM", "must be true or false")
            })?;

        Ok(Self {
            database_url,
            worker_count,
            run_projections,
            query_expiry: Duration::from_secs(expiry_secs),
            initialize_system_projections,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
