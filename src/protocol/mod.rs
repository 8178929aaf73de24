//! Wire protocol
//!
//! Everything the broker shares with the kit process and the client sessions:
//! token helpers, tile descriptors, the kit frame codec, and document URI
//! handling. The textual formats here are compatibility surfaces; kits are
//! not rewritten together with the server.

/// Token and `key=value` helpers
pub mod tokens;

/// Tile and tile-combined descriptors
pub mod tile;

/// Length-prefixed kit frame codec
pub mod frame;

/// Document URIs, keys and cache paths
pub mod uri;

pub use tile::{TileCombined, TileDesc, TileKey, TileParseError};
pub use uri::UriError;

/// WebSocket close code sent when the server is going away (kit death,
/// shutdown, idle teardown).
pub const CLOSE_ENDPOINT_GOING_AWAY: u16 = 1001;
