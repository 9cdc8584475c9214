//! Arquebus - a scheduled HTTP load testing service
//!
//! Test definitions are registered over an HTTP API and kept in a SQLite
//! store. A scheduler wakes up on a fixed interval and runs every stored
//! definition through a rate-controlled attacker, persisting one report per
//! run.
//!
//! The attacker can also be used on its own:
//!
//! ```rust,no_run
//! use arquebus::{AttackConfig, Attacker, TestDefinition};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let definition = TestDefinition {
//!         name: "smoke".to_string(),
//!         url: "http://127.0.0.1:8080/health".to_string(),
//!         method: "GET".to_string(),
//!         rate: 10,
//!         duration: "2s".to_string(),
//!     };
//!
//!     let attacker = Attacker::new(AttackConfig::default())?;
//!     let report = attacker.run_once(&definition, &CancellationToken::new()).await?;
//!     println!("{}", arquebus::report::render_text(&report));
//!
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod attack;
pub mod cache;
pub mod config;
pub mod definitions;
pub mod error;
pub mod models;
pub mod report;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod utils;

pub use attack::{AttackConfig, Attacker};
pub use cache::IndexCache;
pub use error::{ApiError, AttackError, DefinitionError, StoreError};
pub use models::{Attack, Hit, Record, RecordId, RunReport, Target, TestDefinition};
pub use scheduler::{Scheduler, SchedulerState, TickSummary};
pub use store::{Collection, MemoryStorage, SqliteStorage, Storage};
