//! # OpenCompiler
//!
//! Runs untrusted source code inside resource-capped Docker sandboxes and
//! streams the program's output back to the caller.
//!
//! ## Components
//!
//! - **Language registry:** language id to image, commands and source file name
//! - **Artifact store:** content-addressed staging directory for source code
//! - **Sandbox:** container lifecycle, stdin delivery and output relay
//! - **Orchestrator:** the per-request pipeline tying the above together
//! - **Gateway:** HTTP surface (`/run`, `/language`, `/node`)

pub mod artifact;
pub mod config;
pub mod error;
pub mod gateway;
pub mod orchestrator;
pub mod registry;
pub mod sandbox;

pub use config::Config;
pub use error::{Error, Result};
pub use orchestrator::{ExecutionRequest, Orchestrator};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const NAME: &str = env!("CARGO_PKG_NAME");
