//! routelit-client
//!
//! Headless client runtime for server-driven UIs. The server owns application
//! state and streams patch actions; the client keeps a component tree in sync
//! with those patches and routes user interactions back to the server.
//!
//! ## Modules
//!
//! - `tree` - component tree, addresses and the seven patch actions
//! - `mutex` - FIFO-fair, target-reentrant async mutex serializing interactions
//! - `transport` - request building and streamed (JSON-lines) responses
//! - `batch` - throttle buffer coalescing bare streamed actions
//! - `manager` - session root and fragment delegates
//! - `host` - location/history seam of the embedding environment
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use routelit_client::{ClientConfig, HttpTransport, MemoryHost, SessionManager, UiEventPayload};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::from_env()?;
//! let transport = Arc::new(HttpTransport::new(config.clone())?);
//! let host = Arc::new(MemoryHost::new("http://localhost:8000/".parse()?));
//! let manager = SessionManager::builder(transport, host).config(config).build();
//!
//! let _sub = manager.subscribe(|tree| println!("{} top-level nodes", tree.children().len()));
//! manager.initialize().await?;
//! manager.handle_event(UiEventPayload::new("submit", "click")).await?;
//! manager.terminate();
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod config;
pub mod error;
pub mod host;
pub mod manager;
pub mod mutex;
pub mod transport;
pub mod tree;

pub use config::ClientConfig;
pub use error::{ConfigError, PatchError, Result, SyncError, TransportError};
pub use host::{Host, MemoryHost};
pub use manager::{EventSender, ManagerPhase, SessionManager, SessionManagerBuilder, Subscription};
pub use mutex::{TargetGuard, TargetMutex};
pub use transport::{FileUpload, HttpTransport, Transport, UiEventPayload};
pub use tree::{Action, ActionsResponse, Address, Component, ResponseItem, Target, Tree};
