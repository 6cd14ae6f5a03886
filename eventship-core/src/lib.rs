//! # eventship-core
//!
//! Durable event queue and batch uploader for client-side analytics.
//!
//! This library provides:
//! - An event queue that persists every accepted event before it is uploaded
//! - Flush policies deciding when buffered events are sent
//! - A batch uploader with retry, drop and disable semantics per response
//! - File-backed storage that survives restarts
//! - Configuration and logging infrastructure
//!
//! ## Architecture
//!
//! Data flows through three stages:
//! - **Ingestion:** [`Client::put`] enriches an event and hands it to the
//!   [`EventQueue`], whose writer task appends it to the open batch
//! - **Rollover:** a flush policy fires, the open batch is closed and its id is
//!   appended to the pending index
//! - **Upload:** the [`BatchUploader`] sends pending batches in order and
//!   removes each one the data plane settles
//!
//! ## Example
//!
//! ```rust,no_run
//! use eventship_core::{Client, Config};
//!
//! # async fn run() -> eventship_core::Result<()> {
//! let config = Config::load()?;
//! let client = Client::builder(config).build().await?;
//!
//! client.track("App Opened", serde_json::Map::new())?;
//! client.flush_and_wait().await?;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use client::{Client, ClientBuilder};
pub use config::Config;
pub use error::{Error, Result};
pub use event::{Event, EventType};
pub use queue::{BatchUploader, EventQueue, RunStop, UploadSummary};
pub use storage::{FileStorage, InMemoryStorage, Storage};
pub use transport::{HttpTransport, Transport};

// Public modules
pub mod backoff;
pub mod client;
pub mod config;
pub mod enrichment;
pub mod error;
pub mod event;
pub mod logging;
pub mod payload;
pub mod policy;
pub mod queue;
pub mod source;
pub mod storage;
pub mod transport;
