pub mod assistants;
pub mod auth;
pub mod constants;
pub mod db;
pub mod delivery;
pub mod fallback;
pub mod health;
pub mod ingress;
pub mod logging;
pub mod main_helper;
pub mod projections;
pub mod redaction;
pub mod str_utils;
pub mod streaming;
pub mod types;
pub mod upstream;

pub use types::*;

pub use main_helper::{AppState, Args};
