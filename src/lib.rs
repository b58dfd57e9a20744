pub mod app;
pub mod cli;
pub mod clock;
pub mod config;
pub mod export;
pub mod letters;
pub mod session;
pub mod store;
pub mod ui;

pub use config::{AppConfig, ConfigLoader, ConfigPaths};
