//! Handreceipt - property accountability with an append-only audit ledger
//!
//! Tracks who holds each piece of equipment, moves custody between users
//! through offers and requests, keeps the attachment forest of components,
//! and records every state change in a hash-chained ledger.
//!
//! ## Layers
//!
//! - **db**: SQLite registry (properties, transfers, offers, components, documents)
//! - **ledger**: append-only, hash-linked audit log in its own database
//! - **storage**: key-addressed file store for generated receipts and scans
//! - **services**: the custody state machine and everything around it
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/handreceipt/
//! ├── handreceipt.db     # Registry database
//! ├── ledger.db          # Audit ledger
//! ├── files/             # Stored objects
//! │   └── hand-receipts/ # One receipt per accepted transfer
//! └── config.toml        # Configuration
//! ```

pub mod config;
pub mod error;
pub mod db;
pub mod ledger;
pub mod storage;
pub mod services;

// Re-exports
pub use config::Config;
pub use error::{HandReceiptError, Result};
pub use db::{HandReceiptDb, Repository};
pub use ledger::{Ledger, LedgerEntry, LedgerEvent, SqliteLedger};
pub use storage::{FileStore, ObjectStorage};
pub use services::{Backends, EventBus, HandReceiptEvent, Services};
