//! # avmeta
//!
//! Metadata acquisition pipeline for adult video files: given a catalog
//! number, fetch descriptive metadata and images from a set of
//! heterogeneous web sources, merge the per-source results per-field under
//! a priority policy, and hand the merged record to a downstream filer.
//!
//! The crate is a library; GUI/CLI shells construct a [`CrawlerInput`] and
//! consume a [`MergedRecord`].
//!
//! ## Example
//!
//! ```no_run
//! use avmeta::{Config, CrawlerInput, ScrapeEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::builder()
//!         .with_cf_bypass_url("http://127.0.0.1:8000")
//!         .build();
//!     let engine = ScrapeEngine::new(config)?;
//!     let input = CrawlerInput::from_number("SSIS-497");
//!     if let Some(record) = engine.call_crawlers(&input).await {
//!         println!("{} ({})", record.data.title, record.data.release);
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod crawlers;
pub mod engine;
pub mod events;
pub mod gather;
pub mod media;
pub mod types;

pub use crate::client::{
    AvWebClient, RequestBody, RequestOptions, WebError, WebResponse, WebResult,
};
pub use crate::client::bypass::{BypassCoordinator, BypassError, BypassGrant};
pub use crate::config::{Config, ConfigBuilder, FieldPriorities, Website};
pub use crate::crawlers::browser::{BrowserFetcher, PageCookie};
pub use crate::crawlers::{Context, CrawlerError, SiteCrawler};
pub use crate::engine::ScrapeEngine;
pub use crate::events::{EventBus, EventHandler, PipelineEvent};
pub use crate::gather::{GatherError, GatherGroup};
pub use crate::types::{CrawlerData, CrawlerInput, Field, ImageCut, MergedRecord};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
