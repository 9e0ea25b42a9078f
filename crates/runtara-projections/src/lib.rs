// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtara Projections - Projection Lifecycle Orchestration
//!
//! This crate manages the lifecycle of event-sourced projections: it keeps a
//! registry of every projection, drives each one through a persisted state
//! machine, and instructs a pool of workers over control streams stored in
//! the same event log the projections read from.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Management clients                              │
//! │          (ManagerHandle::send, or commands on the master stream)        │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Projection Manager                              │
//! │   registry (name ↔ id) · round-robin placement · managed projections    │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │ $projections-$<worker>                ▲ $projections-$master
//!           ▼                                       │
//! ┌───────────────────────┐                    ┌─────────────────────────────┐
//! │  CoreCommandReader    │───────────────────►│      CoreResponseWriter     │
//! │  (one per worker)     │   ProjectionCore   │                             │
//! └───────────────────────┘                    └─────────────────────────────┘
//!           │
//!           ▼
//! ┌───────────────────────┐
//! │       EventLog        │
//! │ (in-memory or SQLite) │
//! └───────────────────────┘
//! ```
//!
//! # Managed Projection States
//!
//! | State | Description |
//! |-------|-------------|
//! | `Creating` | Definition not loaded yet |
//! | `Loading` / `Loaded` | Definition being read / read |
//! | `Preparing` / `Prepared` | Worker parsing the query / parsed |
//! | `Starting` / `Running` | Worker starting / processing events |
//! | `Stopping` / `Stopped` | Worker stopping / stopped |
//! | `Completed` | Reached the end of its sources |
//! | `Aborting` / `Aborted` | Killed without checkpoint |
//! | `LoadingStopped` | Loaded on a worker without starting |
//! | `Faulted` | Worker reported a fault |
//! | `Deleting` | Removing its streams |
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `RUNTARA_PROJECTIONS_DATABASE_URL` | Yes | - | SQLite URL or path |
//! | `RUNTARA_PROJECTIONS_WORKERS` | No | `3` | Worker queue count |
//! | `RUNTARA_PROJECTIONS_RUN` | No | `system` | `none`, `system` or `all` |
//! | `RUNTARA_PROJECTIONS_QUERY_EXPIRY_SECS` | No | `300` | Transient projection TTL |
//! | `RUNTARA_PROJECTIONS_INIT_SYSTEM` | No | `true` | Create system projections |
//!
//! # Modules
//!
//! - [`manager`]: Projection manager actor and its handle
//! - [`managed_projection`]: Per-projection lifecycle state machine
//! - [`control_stream`]: Control-stream writer and readers
//! - [`coordinator`]: Start/stop of the worker-side components
//! - [`event_log`]: Event log abstraction and backends
//! - [`runtime`]: Embeddable runtime wiring everything together

#![deny(missing_docs)]

/// Fire-and-forget publishing between actors.
pub mod bus;

/// Server configuration loaded from environment variables.
pub mod config;

/// Control-stream protocol between manager and workers.
pub mod control_stream;

/// Core coordinator for worker-side components.
pub mod coordinator;

/// Worker-side projection engine seam and loopback engine.
pub mod core;

/// Correlation of requests and responses by id.
pub mod dispatcher;

/// Error types with error code mapping.
pub mod error;

/// Event log abstraction with in-memory and SQLite backends.
pub mod event_log;

/// Managed projection state machine.
pub mod managed_projection;

/// Projection manager actor.
pub mod manager;

/// Management and worker messages.
pub mod messages;

/// SQLite migrations for the event log.
pub mod migrations;

/// Projection model types.
pub mod model;

/// Stream names, event types and protocol constants.
pub mod names;

/// Embeddable runtime.
pub mod runtime;

/// Single-slot timeout scheduler.
pub mod timeout;
