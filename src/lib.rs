//! s3-cli library
//!
//! Parallel, resumable transfers between local files and S3-compatible
//! object stores.
//!
//! # Features
//!
//! - **Multipart**: large objects move as parallel parts, each retried on
//!   its own with exponential backoff
//! - **Single request**: small and empty objects use one PUT/GET
//! - **Resumable**: completed parts are journaled so an interrupted transfer
//!   continues where it stopped
//! - **SigV4**: requests are signed locally; any S3-compatible endpoint works
//!
//! # Example
//!
//! ```no_run
//! use s3_cli::config::ConfigLoader;
//! use s3_cli::s3::S3Client;
//! use s3_cli::transfer::{TransferCoordinator, TransferRequest, TransferSettings};
//! use s3_cli::transport::Transport;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ConfigLoader::load("config.yaml")?;
//!     let transport = Arc::new(Transport::new(config.http.to_transport_config())?);
//!     let client = Arc::new(S3Client::from_config(&config.s3, transport)?);
//!     let settings = TransferSettings::from_config(&config.transfer, &config.retry);
//!
//!     let coordinator = TransferCoordinator::new(client, settings);
//!     let request = TransferRequest::download("my-bucket", "logs/app.log", "app.log");
//!     coordinator.run(request).await?.ensure_completed()?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod logging;
pub mod metrics;
pub mod s3;
pub mod transfer;
pub mod transport;

// Re-export commonly used types
pub use config::Config;
pub use s3::S3Client;
pub use transfer::{TransferCoordinator, TransferRequest, TransferResult};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
