//! # qzWhatNext Core Library
//!
//! The deterministic scheduling engine behind qzWhatNext: given a user's
//! open tasks, calendar reservations and preferences, it answers "what
//! should I do right now, and next?" with an explainable schedule.
//! Identical inputs always produce identical outputs.
//!
//! ## Features
//!
//! - **Ten-stage rebuild pipeline**: materialization, exclusion gating,
//!   structured attribute inference, feasibility validation, governing-tier
//!   assignment, intra-tier ranking, availability subtraction, placement,
//!   and transactional audit
//! - **Nine-level priority hierarchy**: each task holds exactly one
//!   governing tier; ranking never crosses tiers at runtime
//! - **Habit recurrence**: non-accumulating series with idempotent
//!   materialization and missed-occurrence handling
//! - **Managed calendar sync**: bidirectional, idempotent reconciliation
//!   restricted to events the engine can prove it owns
//! - **First-class overflow**: a task that cannot be placed becomes a
//!   structured outcome record, never a silent drop
//!
//! ## Core Modules
//!
//! - [`db`]: database connection and migration management
//! - [`models`]: persisted entities and transfer objects
//! - [`repository`]: user-scoped data access with the Repository pattern
//! - [`recurrence`]: recurrence rules and habit-window arithmetic
//! - [`engine`]: the rebuild pipeline and its stage modules
//! - [`sync`]: the managed calendar synchronizer
//! - [`audit`]: append-only decision records
//! - [`config`]: immutable engine configuration
//! - [`error`]: the error taxonomy
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use qzwhatnext_core::{
//!     config::EngineConfig,
//!     db,
//!     engine::{inference::FixedInferenceProvider, SchedulingEngine},
//!     repository::{SqliteRepository, UserRepository},
//! };
//!
//! # #[derive(Default)] struct NoCalendar;
//! # #[async_trait::async_trait]
//! # impl qzwhatnext_core::engine::availability::AvailabilityProvider for NoCalendar {
//! #     async fn busy_intervals(
//! #         &self,
//! #         _user_id: uuid::Uuid,
//! #         _window: qzwhatnext_core::engine::availability::Interval,
//! #     ) -> Result<Vec<qzwhatnext_core::engine::availability::BusyInterval>, qzwhatnext_core::error::EngineError> {
//! #         Ok(vec![])
//! #     }
//! # }
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = db::establish_connection("qzwhatnext.db").await?;
//!     let repository = Arc::new(SqliteRepository::new(pool));
//!
//!     let user = repository.create_user("America/New_York").await?;
//!
//!     let engine = SchedulingEngine::new(
//!         repository,
//!         Arc::new(NoCalendar),
//!         Arc::new(FixedInferenceProvider::new()),
//!         EngineConfig::default(),
//!     )?;
//!
//!     let outcome = engine.rebuild(user.id).await?;
//!     println!("placed {} blocks", outcome.blocks.len());
//!
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod models;
pub mod recurrence;
pub mod repository;
pub mod sync;
pub mod timezone;
