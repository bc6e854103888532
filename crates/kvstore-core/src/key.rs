//! Key helpers shared by all backends.
//!
//! Keys are slash-delimited logical paths. Backends store them in the
//! canonical form `/path/to/key`: one leading slash, no trailing slash and no
//! empty segments.

/// Split a key into its non-empty path segments.
///
/// `"/a//b/"` and `"a/b"` both yield `["a", "b"]`.
pub fn split_key(key: &str) -> Vec<&str> {
    key.split('/').filter(|part| !part.is_empty()).collect()
}

/// Normalize a key to the form `/path/to/key`.
///
/// The empty key and `"/"` normalize to the root `"/"`.
pub fn normalize(key: &str) -> String {
    format!("/{}", split_key(key).join("/"))
}

/// Join a directory and a child name into a normalized key.
pub fn join_key(directory: &str, child: &str) -> String {
    normalize(&format!("{}/{}", directory, child))
}
