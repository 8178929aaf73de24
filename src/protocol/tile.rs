//! Tile descriptors
//!
//! A tile is a rectangular rendered region of a document part, identified by
//! its position and size in twips plus the rendered pixel size. Descriptors
//! travel as `key=value` tokens; combined descriptors carry comma-separated
//! lists for the per-tile fields. The wire format is shared with the kit and
//! must not change shape.

use thiserror::Error;

/// Errors from descriptor parsing.
#[derive(Debug, Error)]
pub enum TileParseError {
    /// A required field is absent.
    #[error("tile descriptor missing field '{field}' in [{line}]")]
    MissingField {
        /// The absent key
        field: String,
        /// The offending line
        line: String,
    },

    /// A field failed to parse as an integer.
    #[error("tile descriptor field '{field}' is not numeric in [{line}]")]
    BadField {
        /// The malformed key
        field: String,
        /// The offending line
        line: String,
    },

    /// Combined descriptor lists disagree in length.
    #[error("tilecombine descriptor has uneven lists in [{line}]")]
    UnevenLists {
        /// The offending line
        line: String,
    },
}

/// Identity of a tile for cache lookup.
///
/// Excludes the version, broadcast flag and image size: a newer render of the
/// same rectangle replaces the old cache entry rather than sitting beside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub part: i32,
    pub width: i32,
    pub height: i32,
    pub tile_pos_x: i32,
    pub tile_pos_y: i32,
    pub tile_width: i32,
    pub tile_height: i32,
}

impl TileKey {
    /// File name for the on-disk cache entry.
    pub fn cache_name(&self) -> String {
        format!(
            "{}_{}_{}_{}_{}_{}_{}.png",
            self.part,
            self.width,
            self.height,
            self.tile_pos_x,
            self.tile_pos_y,
            self.tile_width,
            self.tile_height
        )
    }

    /// Recover a key from an on-disk cache file name, for rebuilding the
    /// index of a persistent cache.
    pub fn from_cache_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(".png")?;
        let fields: Vec<i32> = stem.split('_').map(|f| f.parse().ok()).collect::<Option<_>>()?;
        let [part, width, height, tile_pos_x, tile_pos_y, tile_width, tile_height] = fields[..]
        else {
            return None;
        };
        Some(TileKey {
            part,
            width,
            height,
            tile_pos_x,
            tile_pos_y,
            tile_width,
            tile_height,
        })
    }

    /// Whether this tile intersects the given document rectangle (twips).
    pub fn intersects(&self, part: i32, x: i32, y: i32, w: i32, h: i32) -> bool {
        if part >= 0 && self.part != part {
            return false;
        }
        let right_ok = w < 0 || self.tile_pos_x < x + w;
        let bottom_ok = h < 0 || self.tile_pos_y < y + h;
        right_ok
            && bottom_ok
            && self.tile_pos_x + self.tile_width > x
            && self.tile_pos_y + self.tile_height > y
    }
}

/// One tile render request or response descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileDesc {
    /// Document part (sheet, slide) the tile belongs to
    pub part: i32,
    /// Rendered width in pixels
    pub width: i32,
    /// Rendered height in pixels
    pub height: i32,
    /// Left edge in twips
    pub tile_pos_x: i32,
    /// Top edge in twips
    pub tile_pos_y: i32,
    /// Tile width in twips
    pub tile_width: i32,
    /// Tile height in twips
    pub tile_height: i32,
    /// Version assigned at request time, -1 when unset
    pub ver: i32,
    /// PNG byte count, used by combined responses to split the tail
    pub img_size: usize,
    /// Render result should go to every session, not just the requester
    pub broadcast: bool,
}

impl TileDesc {
    /// Parse a descriptor from a command line such as
    /// `tile part=0 width=256 height=256 tileposx=0 tileposy=0 tilewidth=3840 tileheight=3840 ver=1`.
    ///
    /// Leading non-`key=value` tokens (the command name) are skipped.
    pub fn parse(line: &str) -> Result<Self, TileParseError> {
        let mut desc = TileDesc {
            part: 0,
            width: 0,
            height: 0,
            tile_pos_x: 0,
            tile_pos_y: 0,
            tile_width: 0,
            tile_height: 0,
            ver: -1,
            img_size: 0,
            broadcast: false,
        };

        fn int_field(key: &str, value: &str, line: &str) -> Result<i32, TileParseError> {
            value.parse().map_err(|_| TileParseError::BadField {
                field: key.to_string(),
                line: line.to_string(),
            })
        }

        let mut seen = [false; 7];
        for tok in line.split_whitespace() {
            let Some((key, value)) = tok.split_once('=') else {
                continue;
            };
            match key {
                "part" => {
                    desc.part = int_field(key, value, line)?;
                    seen[0] = true;
                }
                "width" => {
                    desc.width = int_field(key, value, line)?;
                    seen[1] = true;
                }
                "height" => {
                    desc.height = int_field(key, value, line)?;
                    seen[2] = true;
                }
                "tileposx" => {
                    desc.tile_pos_x = int_field(key, value, line)?;
                    seen[3] = true;
                }
                "tileposy" => {
                    desc.tile_pos_y = int_field(key, value, line)?;
                    seen[4] = true;
                }
                "tilewidth" => {
                    desc.tile_width = int_field(key, value, line)?;
                    seen[5] = true;
                }
                "tileheight" => {
                    desc.tile_height = int_field(key, value, line)?;
                    seen[6] = true;
                }
                "ver" => desc.ver = int_field(key, value, line)?,
                "imgsize" => {
                    desc.img_size = value.parse().map_err(|_| TileParseError::BadField {
                        field: key.to_string(),
                        line: line.to_string(),
                    })?
                }
                "broadcast" => desc.broadcast = value == "yes",
                _ => {}
            }
        }

        const NAMES: [&str; 7] = [
            "part", "width", "height", "tileposx", "tileposy", "tilewidth", "tileheight",
        ];
        if let Some(idx) = seen.iter().position(|s| !s) {
            return Err(TileParseError::MissingField {
                field: NAMES[idx].to_string(),
                line: line.to_string(),
            });
        }

        Ok(desc)
    }

    /// Serialize with the given command prefix, e.g. `tile` or `tile:`.
    pub fn serialize(&self, prefix: &str) -> String {
        let mut out = format!(
            "{} part={} width={} height={} tileposx={} tileposy={} tilewidth={} tileheight={}",
            prefix,
            self.part,
            self.width,
            self.height,
            self.tile_pos_x,
            self.tile_pos_y,
            self.tile_width,
            self.tile_height
        );
        if self.ver >= 0 {
            out.push_str(&format!(" ver={}", self.ver));
        }
        if self.img_size > 0 {
            out.push_str(&format!(" imgsize={}", self.img_size));
        }
        if self.broadcast {
            out.push_str(" broadcast=yes");
        }
        out
    }

    /// Cache identity (version-free).
    pub fn key(&self) -> TileKey {
        TileKey {
            part: self.part,
            width: self.width,
            height: self.height,
            tile_pos_x: self.tile_pos_x,
            tile_pos_y: self.tile_pos_y,
            tile_width: self.tile_width,
            tile_height: self.tile_height,
        }
    }

    /// File name for the on-disk cache entry. Inverse of [`TileKey::from_cache_name`].
    pub fn cache_name(&self) -> String {
        self.key().cache_name()
    }

    /// Short identifier used in `canceltiles` messages to the kit.
    pub fn cancel_id(&self) -> String {
        format!("{},{},{}", self.part, self.tile_pos_x, self.tile_pos_y)
    }

    /// Whether this tile intersects the given document rectangle (twips).
    /// A negative width or height means "to the end of the document".
    pub fn intersects(&self, part: i32, x: i32, y: i32, w: i32, h: i32) -> bool {
        self.key().intersects(part, x, y, w, h)
    }
}

/// A batch of tiles sharing geometry, with per-tile position lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileCombined {
    pub part: i32,
    pub width: i32,
    pub height: i32,
    pub tile_pos_x: Vec<i32>,
    pub tile_pos_y: Vec<i32>,
    pub tile_width: i32,
    pub tile_height: i32,
    pub ver: i32,
    pub img_sizes: Vec<usize>,
}

impl TileCombined {
    /// Parse from a `tilecombine` line with comma-separated position lists.
    pub fn parse(line: &str) -> Result<Self, TileParseError> {
        fn need<'a>(line: &'a str, key: &str) -> Result<&'a str, TileParseError> {
            crate::protocol::tokens::token_value(line, key).ok_or_else(|| {
                TileParseError::MissingField {
                    field: key.to_string(),
                    line: line.to_string(),
                }
            })
        }
        fn int(line: &str, key: &str) -> Result<i32, TileParseError> {
            need(line, key)?.parse().map_err(|_| TileParseError::BadField {
                field: key.to_string(),
                line: line.to_string(),
            })
        }
        fn int_list(line: &str, key: &str) -> Result<Vec<i32>, TileParseError> {
            need(line, key)?
                .split(',')
                .map(|v| v.parse::<i32>())
                .collect::<Result<_, _>>()
                .map_err(|_| TileParseError::BadField {
                    field: key.to_string(),
                    line: line.to_string(),
                })
        }

        let tile_pos_x = int_list(line, "tileposx")?;
        let tile_pos_y = int_list(line, "tileposy")?;
        if tile_pos_x.len() != tile_pos_y.len() || tile_pos_x.is_empty() {
            return Err(TileParseError::UnevenLists {
                line: line.to_string(),
            });
        }

        let img_sizes = match crate::protocol::tokens::token_value(line, "imgsize") {
            Some(list) => {
                let sizes: Vec<usize> = list
                    .split(',')
                    .map(|v| v.parse::<usize>())
                    .collect::<Result<_, _>>()
                    .map_err(|_| TileParseError::BadField {
                        field: "imgsize".to_string(),
                        line: line.to_string(),
                    })?;
                if sizes.len() != tile_pos_x.len() {
                    return Err(TileParseError::UnevenLists {
                        line: line.to_string(),
                    });
                }
                sizes
            }
            None => Vec::new(),
        };

        Ok(TileCombined {
            part: int(line, "part")?,
            width: int(line, "width")?,
            height: int(line, "height")?,
            tile_pos_x,
            tile_pos_y,
            tile_width: int(line, "tilewidth")?,
            tile_height: int(line, "tileheight")?,
            ver: crate::protocol::tokens::token_int(line, "ver").unwrap_or(-1) as i32,
            img_sizes,
        })
    }

    /// Serialize with the given command prefix.
    pub fn serialize(&self, prefix: &str) -> String {
        let join = |v: &[i32]| v.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(",");
        let mut out = format!(
            "{} part={} width={} height={} tileposx={} tileposy={} tilewidth={} tileheight={}",
            prefix,
            self.part,
            self.width,
            self.height,
            join(&self.tile_pos_x),
            join(&self.tile_pos_y),
            self.tile_width,
            self.tile_height
        );
        if self.ver >= 0 {
            out.push_str(&format!(" ver={}", self.ver));
        }
        if !self.img_sizes.is_empty() {
            let sizes = self
                .img_sizes
                .iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
                .join(",");
            out.push_str(&format!(" imgsize={}", sizes));
        }
        out
    }

    /// Expand into the individual tile descriptors.
    pub fn tiles(&self) -> Vec<TileDesc> {
        self.tile_pos_x
            .iter()
            .zip(&self.tile_pos_y)
            .enumerate()
            .map(|(i, (&x, &y))| TileDesc {
                part: self.part,
                width: self.width,
                height: self.height,
                tile_pos_x: x,
                tile_pos_y: y,
                tile_width: self.tile_width,
                tile_height: self.tile_height,
                ver: self.ver,
                img_size: self.img_sizes.get(i).copied().unwrap_or(0),
                broadcast: false,
            })
            .collect()
    }

    /// Rebuild a combined request from residual tiles (shared geometry is
    /// taken from the first tile).
    pub fn from_tiles(tiles: &[TileDesc]) -> Option<Self> {
        let first = tiles.first()?;
        Some(TileCombined {
            part: first.part,
            width: first.width,
            height: first.height,
            tile_pos_x: tiles.iter().map(|t| t.tile_pos_x).collect(),
            tile_pos_y: tiles.iter().map(|t| t.tile_pos_y).collect(),
            tile_width: first.tile_width,
            tile_height: first.tile_height,
            ver: first.ver,
            img_sizes: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TileDesc {
        TileDesc {
            part: 0,
            width: 256,
            height: 256,
            tile_pos_x: 3840,
            tile_pos_y: 7680,
            tile_width: 3840,
            tile_height: 3840,
            ver: 7,
            img_size: 0,
            broadcast: false,
        }
    }

    #[test]
    fn test_roundtrip() {
        let desc = sample();
        let line = desc.serialize("tile");
        let parsed = TileDesc::parse(&line).unwrap();
        assert_eq!(parsed, desc);
    }

    #[test]
    fn test_key_excludes_version_and_broadcast() {
        let a = sample();
        let mut b = sample();
        b.ver = 99;
        b.broadcast = true;
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_missing_field_rejected() {
        let err = TileDesc::parse("tile part=0 width=256").unwrap_err();
        assert!(matches!(err, TileParseError::MissingField { .. }));
    }

    #[test]
    fn test_combined_roundtrip() {
        let combined = TileCombined {
            part: 0,
            width: 256,
            height: 256,
            tile_pos_x: vec![0, 3840, 7680],
            tile_pos_y: vec![0, 0, 0],
            tile_width: 3840,
            tile_height: 3840,
            ver: 3,
            img_sizes: vec![],
        };
        let line = combined.serialize("tilecombine");
        let parsed = TileCombined::parse(&line).unwrap();
        assert_eq!(parsed, combined);
        assert_eq!(parsed.tiles().len(), 3);
    }

    #[test]
    fn test_combined_uneven_lists() {
        let line = "tilecombine part=0 width=256 height=256 tileposx=0,3840 tileposy=0 tilewidth=3840 tileheight=3840";
        assert!(matches!(
            TileCombined::parse(line),
            Err(TileParseError::UnevenLists { .. })
        ));
    }

    #[test]
    fn test_cache_name_roundtrip() {
        let key = sample().key();
        assert_eq!(TileKey::from_cache_name(&key.cache_name()), Some(key));
        assert_eq!(TileKey::from_cache_name("modtime.txt"), None);
        assert_eq!(TileKey::from_cache_name("1_2_3.png"), None);
    }

    #[test]
    fn test_intersects() {
        let t = sample();
        assert!(t.intersects(0, 0, 0, 10000, 10000));
        assert!(!t.intersects(1, 0, 0, 10000, 10000));
        assert!(!t.intersects(0, 0, 0, 3840, 7680));
        // Negative extents reach the document edge.
        assert!(t.intersects(0, 0, 0, -1, -1));
    }
}
