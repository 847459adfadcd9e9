//! # Prodline
//!
//! Host-side control for a serial labeling device on a production line.
//!
//! ## Crate Structure
//!
//! - **`config`**: Layered configuration (TOML file plus `PRODLINE_` environment
//!   overrides) loaded with figment.
//! - **`device`**: The device session (connection lifecycle, line-oriented
//!   transport) and the append-only transcript used for signal correlation.
//! - **`error`**: The `ProdlineError` enum shared across the crate.
//! - **`hardware`**: Traits for choosing and opening a device link, with a
//!   tokio-serial backend and a simulated device.
//! - **`logging`**: tracing-subscriber initialization.
//! - **`printing`**: Unit labels and the printer collaborator.
//! - **`production`**: Orders, run state and the run controller.
//! - **`storage`**: Persistence of finalized run records.

pub mod config;
pub mod device;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod printing;
pub mod production;
pub mod storage;
