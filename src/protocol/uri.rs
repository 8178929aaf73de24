//! Document URIs, keys and cache paths
//!
//! The public URI identifies where a document lives (a WOPI host or a local
//! path). The document key is derived from the percent-encoded path only:
//! host names and query parameters are deliberately excluded so that the same
//! document opened through aliased hostnames lands on one broker. Storing the
//! host would force aliased opens to load as separate documents, and saving
//! would overwrite one another.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

/// Characters percent-encoded when canonicalizing a document key.
///
/// Everything a URL path cannot carry literally, plus `%` itself so the
/// encoding is stable under repeated decode/encode cycles.
const DOC_KEY_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Characters the kit cannot handle in jailed file paths.
const JAIL_PATH_SET: &AsciiSet = &CONTROLS.add(b'#').add(b'%');

/// Errors from public-URI handling.
#[derive(Debug, Error)]
pub enum UriError {
    /// The URI could not be parsed at all.
    #[error("invalid document URI: {message}")]
    Invalid {
        /// Human-readable error message
        message: String,
    },

    /// The URI parsed but carries no document path.
    #[error("document URI has an empty path")]
    EmptyPath,
}

/// Sanitize a raw request URI into a canonical public URI.
///
/// The incoming URI arrives url-encoded; it is decoded once and re-parsed so
/// that query parameters (the access token in particular) carry their actual
/// values. Plain absolute paths are treated as `file:` URIs.
pub fn sanitize_uri(raw: &str) -> Result<Url, UriError> {
    let decoded = percent_decode_str(raw).decode_utf8().map_err(|e| UriError::Invalid {
        message: format!("not valid UTF-8 after decoding: {}", e),
    })?;

    let url = match Url::parse(&decoded) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            Url::from_file_path(Path::new(decoded.as_ref())).map_err(|_| UriError::Invalid {
                message: format!("relative URI is not an absolute path: {}", decoded),
            })?
        }
        Err(e) => {
            return Err(UriError::Invalid {
                message: e.to_string(),
            })
        }
    };

    if url.path().is_empty() || url.path() == "/" {
        return Err(UriError::EmptyPath);
    }

    Ok(url)
}

/// Canonical document key for a public URI.
///
/// Two requests that should collaborate produce equal keys; two that must not
/// produce distinct keys. Stable under re-encoding of the path.
pub fn doc_key(uri: &Url) -> String {
    let decoded = percent_decode_str(uri.path())
        .decode_utf8()
        .unwrap_or_else(|_| uri.path().into());
    utf8_percent_encode(&decoded, DOC_KEY_SET).to_string()
}

/// The decoded `access_token` query parameter, if present.
pub fn access_token(uri: &Url) -> Option<String> {
    uri.query_pairs()
        .find(|(k, _)| k == "access_token")
        .map(|(_, v)| v.into_owned())
}

/// Whether the URI carries `docpass=yes`, which bypasses the token ledger.
pub fn has_doc_pass(uri: &Url) -> bool {
    uri.query_pairs().any(|(k, v)| k == "docpass" && v == "yes")
}

/// On-disk cache directory for a document URI.
///
/// The SHA-1 of the full URI, hex-encoded and split `h/e/x/rest` for
/// directory fan-out under the cache root.
pub fn cache_path(cache_root: &Path, uri: &str) -> PathBuf {
    let digest = Sha1::digest(uri.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    cache_root
        .join(&hex[0..1])
        .join(&hex[1..2])
        .join(&hex[2..3])
        .join(&hex[3..])
}

/// Hex SHA-1 of a byte buffer, used for the downloaded-document audit log.
pub fn sha1_hex(bytes: &[u8]) -> String {
    Sha1::digest(bytes).iter().map(|b| format!("{:02x}", b)).collect()
}

/// Percent-encode a jailed path so the kit can open it.
pub fn encode_jailed_path(path: &str) -> String {
    utf8_percent_encode(path, JAIL_PATH_SET).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_key_excludes_host_and_query() {
        let a = sanitize_uri("https://office.example.com/wopi/files/42?access_token=abc").unwrap();
        let b = sanitize_uri("https://alias.example.org/wopi/files/42?access_token=xyz").unwrap();
        assert_eq!(doc_key(&a), doc_key(&b));
        assert_eq!(doc_key(&a), "/wopi/files/42");
    }

    #[test]
    fn test_doc_key_distinct_documents() {
        let a = sanitize_uri("https://host/wopi/files/42").unwrap();
        let b = sanitize_uri("https://host/wopi/files/43").unwrap();
        assert_ne!(doc_key(&a), doc_key(&b));
    }

    #[test]
    fn test_doc_key_stable_under_reencoding() {
        let once = sanitize_uri("https://host/wopi/files/report%20final.odt").unwrap();
        let key = doc_key(&once);
        // Re-deriving from the encoded key path must not change it.
        let again = sanitize_uri(&format!("https://host{}", key)).unwrap();
        assert_eq!(doc_key(&again), key);
    }

    #[test]
    fn test_sanitize_rejects_empty_path() {
        assert!(matches!(sanitize_uri("https://host"), Err(UriError::EmptyPath)));
    }

    #[test]
    fn test_sanitize_local_path() {
        let url = sanitize_uri("/srv/documents/budget.ods").unwrap();
        assert_eq!(url.scheme(), "file");
        assert_eq!(url.path(), "/srv/documents/budget.ods");
    }

    #[test]
    fn test_access_token_decoded() {
        let url = sanitize_uri("https://host/wopi/files/1?access_token=a%2Bb%3Dc").unwrap();
        assert_eq!(access_token(&url).as_deref(), Some("a+b=c"));
    }

    #[test]
    fn test_doc_pass() {
        let yes = sanitize_uri("https://host/f/1?docpass=yes").unwrap();
        let no = sanitize_uri("https://host/f/1?docpass=no").unwrap();
        assert!(has_doc_pass(&yes));
        assert!(!has_doc_pass(&no));
    }

    #[test]
    fn test_cache_path_fanout() {
        let p = cache_path(Path::new("/var/cache/coedit"), "https://host/wopi/files/42");
        let s = p.to_string_lossy();
        assert!(s.starts_with("/var/cache/coedit/"));
        // root + three one-char fanout dirs + 37-char remainder
        assert_eq!(p.components().count(), 3 + 1 + 3 + 1);
    }

    #[test]
    fn test_encode_jailed_path() {
        assert_eq!(encode_jailed_path("/jail/user/doc/a#b%c.odt"), "/jail/user/doc/a%23b%25c.odt");
    }
}
