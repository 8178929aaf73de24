//! Property-based tests for the protocol layer
//!
//! Uses proptest to generate random inputs and verify document-key
//! canonicalization, cache-path determinism and tile descriptor wire
//! round-trips.

use proptest::prelude::*;
use std::path::Path;

use coedit::protocol::uri::{cache_path, doc_key, sanitize_uri};
use coedit::protocol::TileDesc;

proptest! {
    #[test]
    fn test_doc_key_stable_under_reencoding(path in "[a-zA-Z0-9 ._~/-]{1,40}") {
        let raw = format!("https://host/{}", path);
        let Ok(uri) = sanitize_uri(&raw) else {
            // Dot-segment paths can normalize to an empty path; those are
            // rejected outright, which is fine.
            return Ok(());
        };
        let key = doc_key(&uri);
        prop_assert!(key.starts_with('/'));

        // Feeding the encoded key back through a different host alias must
        // land on the same key.
        let again = sanitize_uri(&format!("https://alias.example{}", key)).unwrap();
        prop_assert_eq!(doc_key(&again), key);
    }

    #[test]
    fn test_doc_key_ignores_host_and_query(
        host in "[a-z][a-z0-9]{0,10}",
        token in "[A-Za-z0-9]{1,16}",
    ) {
        let aliased = sanitize_uri(&format!(
            "https://{}/wopi/files/7?access_token={}",
            host, token
        )).unwrap();
        let canonical = sanitize_uri("https://canonical/wopi/files/7").unwrap();
        prop_assert_eq!(doc_key(&aliased), doc_key(&canonical));
    }

    #[test]
    fn test_cache_path_deterministic(uri in ".{1,80}") {
        let first = cache_path(Path::new("/cache"), &uri);
        let second = cache_path(Path::new("/cache"), &uri);
        prop_assert_eq!(&first, &second);

        // Root (2 components) + three fan-out dirs + hash remainder.
        prop_assert_eq!(first.components().count(), 6);
    }

    #[test]
    fn test_tile_desc_wire_roundtrip(
        part in 0..8i32,
        col in 0..1000i32,
        row in 0..1000i32,
        ver in 0..100_000i32,
        broadcast: bool,
    ) {
        let desc = TileDesc {
            part,
            width: 256,
            height: 256,
            tile_pos_x: col * 3840,
            tile_pos_y: row * 3840,
            tile_width: 3840,
            tile_height: 3840,
            ver,
            img_size: 0,
            broadcast,
        };
        let parsed = TileDesc::parse(&desc.serialize("tile")).unwrap();
        prop_assert_eq!(parsed, desc);
    }

    #[test]
    fn test_tile_key_ignores_render_metadata(
        ver_a in -1..1000i32,
        ver_b in -1..1000i32,
        broadcast_a: bool,
        broadcast_b: bool,
    ) {
        let base = TileDesc {
            part: 1,
            width: 256,
            height: 256,
            tile_pos_x: 3840,
            tile_pos_y: 7680,
            tile_width: 3840,
            tile_height: 3840,
            ver: ver_a,
            img_size: 0,
            broadcast: broadcast_a,
        };
        let other = TileDesc { ver: ver_b, broadcast: broadcast_b, ..base.clone() };
        prop_assert_eq!(base.key(), other.key());
    }
}
