// src/lib.rs
pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod logger;
pub mod parser;
pub mod queue;
pub mod router;
pub mod server;
pub mod store;
pub mod sync;
pub mod syscalls;
pub mod timer;
pub mod worker;

// Re-exports for users
pub use config::{ConcurrencyMode, ServerConfig, TriggerMode};
pub use error::{EmberError, EmberResult};
pub use http::{HttpRequest, HttpResponse, Method, RenderError};
pub use logger::FileLogger;
pub use router::Router;
pub use server::{Server, ShutdownHandle};
pub use store::{MemoryStore, StoreGuard, StorePool, UserStore};
