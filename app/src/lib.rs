//! meshflux application layer: CLI, logging, shared directory, host messages.

pub mod cli;
pub mod config_loader;
pub mod host;
pub mod logging;
