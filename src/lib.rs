//! Backend of a configurable desktop toolbar.
//!
//! - [`plugins`]: discovers, loads and runs third-party toolbar plugins
//! - [`exec`]: runs commands and applications, with timeout and elevation
//! - [`bridge`]: text-in/text-out capabilities for the script host, and the
//!   stdio transport that carries them
//! - [`toolbar`]: the toolbar/button layout the host edits

pub mod bridge;
pub mod config;
pub mod exec;
pub mod plugins;
pub mod toolbar;
