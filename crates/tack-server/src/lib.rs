//! tack-server - Collaboration gateway for Tack
//!
//! Stateless HTTP front for the shared SQLite note store. Clients in
//! remote-proxy mode speak the `/api` surface defined in `routes`; the
//! gateway assigns note ids and maintains per-note versions.

pub mod config;
pub mod error;
pub mod routes;
pub mod store;

pub use config::ServerConfig;
pub use error::AppError;
pub use routes::{app_router, AppState};
pub use store::NoteStore;
