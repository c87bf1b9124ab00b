//! sitepool - site-isolating worker process pool.
//!
//! A [`pool::ProcessPool`] launches worker processes in several roles
//! (content, network, GPU, plugin, service-worker host), assigns pages to
//! content processes by registrable domain and data store, and keeps idle
//! processes warm in a Process Cache and back/forward retention.
//!
//! ```no_run
//! use sitepool::config::PoolConfiguration;
//! use sitepool::pool::{NavigationRequest, PoolContext, ProcessPool};
//! use sitepool::types::DataStore;
//!
//! # fn main() -> sitepool::error::Result<()> {
//! let context = PoolContext::system();
//! let pool = ProcessPool::create(&context, PoolConfiguration::new())?;
//! let page = pool.borrow_mut().create_page(DataStore::persistent(0), None)?;
//! let url = url::Url::parse("https://a.example/")?;
//! pool.borrow_mut().navigate(page, NavigationRequest::new(url))?;
//! pool.borrow_mut().process_events();
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod domain;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod memory_pressure;
pub mod pool;
pub mod process;
pub mod simulate;
pub mod types;

pub use error::{PoolError, Result};
