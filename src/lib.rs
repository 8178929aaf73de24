//! coedit - Collaborative Document Server
//!
//! A server that lets many browser clients view and edit the same office
//! document concurrently over WebSockets. Each open document is coordinated
//! by a dedicated broker task that owns a kit child process (the renderer
//! holding the authoritative document state), the set of client sessions, a
//! rendered-tile cache and a storage binding (local path or WOPI host).
//!
//! # Module Structure
//!
//! - **`protocol`** - The textual/framed wire protocol shared with kits and
//!   clients: tokens, tile descriptors, the frame codec, document URIs.
//! - **`broker`** - The per-document core: broker event loop, registry,
//!   sessions, kit process handles.
//! - **`storage`** - Where documents live: local filesystem, WOPI over
//!   HTTP, and the access-token ledger.
//! - **`tilecache`** - Rendered-tile store with render subscriptions.
//! - **`server`** - Axum front end: config, wiring, WebSocket glue.
//! - **`telemetry`** - Per-document stats for the admin snapshot.
//!
//! # Concurrency Model
//!
//! One task per document broker; all broker state is owned by that task.
//! External code interacts through the registry (find-or-create), the
//! broker's event channel, and a stop signal. At most one save is in
//! flight per document; storage I/O awaits inline in the broker loop and
//! can only stall its own document.

pub mod broker;
pub mod error;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod telemetry;
pub mod tilecache;

pub use broker::{BrokerHandle, BrokerRegistry, DocumentBroker};
pub use error::{DocError, StorageError};
