pub mod api;
pub mod config;
pub mod server;
pub mod ws;

pub use config::ServerConfig;
pub use server::{AppState, router, run};
