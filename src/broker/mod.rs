//! Per-document coordination
//!
//! One [`document::DocumentBroker`] per open document, found or created
//! through the process-global [`registry::BrokerRegistry`]. The broker owns
//! its kit child process, client sessions and tile cache; sessions and kits
//! are the leaf types it coordinates.

/// The document broker event loop
pub mod document;

/// Kit child-process handle and pool
pub mod kit;

/// Process-global broker registry
pub mod registry;

/// Per-client session state
pub mod session;

pub use document::{BrokerEvent, BrokerHandle, DocumentBroker};
pub use kit::{KitPool, KitProcess};
pub use registry::{BrokerRegistry, Services};
pub use session::{ClientSession, OutboundMessage};
