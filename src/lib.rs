pub mod auth;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod lifecycle;
pub mod models;
pub mod tasks;
pub mod voting;

pub use error::{Result, TallyError};
pub use lifecycle::VoteLifecycle;
