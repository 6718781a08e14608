//! Path normalisation and object-key derivation.
//!
//! Every path that crosses a subsystem boundary is normalised first:
//! absolute, lexically cleaned, forward-slash separated. Containment
//! against the watch roots is the gate that rejects traversal attempts.

use std::path::{Component, Path, PathBuf};

use crate::utils::errors::{AgentError, Result};

/// Characters that split a raw multi-root configuration string.
const ROOT_SEPARATORS: [char; 8] = [',', ';', '\n', '\r', '\t', ' ', '，', '；'];

/// Convert a path to its canonical in-process form: absolute, cleaned,
/// `/`-separated. Drive letters are lowercased on Windows. Purely
/// lexical, the path does not need to exist.
pub fn normalise(path: &Path) -> String {
    let absolute: PathBuf = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    };

    let mut prefix = String::new();
    let mut parts: Vec<String> = Vec::new();
    for component in absolute.components() {
        match component {
            Component::Prefix(p) => {
                prefix = p.as_os_str().to_string_lossy().replace('\\', "/");
                if cfg!(windows) {
                    prefix = prefix.to_lowercase();
                }
            }
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                parts.pop();
            }
            Component::Normal(seg) => parts.push(seg.to_string_lossy().into_owned()),
        }
    }

    if parts.is_empty() {
        format!("{}/", prefix)
    } else {
        format!("{}/{}", prefix, parts.join("/"))
    }
}

fn fold_case(path: &str) -> String {
    if cfg!(windows) {
        path.to_lowercase()
    } else {
        path.to_string()
    }
}

/// Equality with OS-appropriate case semantics. Both sides must already
/// be normalised.
pub fn paths_equal(a: &str, b: &str) -> bool {
    fold_case(a) == fold_case(b)
}

/// Containment check used everywhere a caller-supplied path meets a
/// watch root. Both sides must already be normalised.
pub fn is_under(root: &str, path: &str) -> bool {
    let root = fold_case(root.trim_end_matches('/'));
    let path = fold_case(path);
    if path == root {
        return true;
    }
    path.starts_with(&format!("{}/", root))
}

/// Split a raw watch-root string on the configured separator set,
/// normalise and de-duplicate. An empty result is a configuration error.
pub fn split_roots(raw: &str) -> Result<Vec<String>> {
    let mut roots: Vec<String> = Vec::new();
    for piece in raw.split(|c| ROOT_SEPARATORS.contains(&c)) {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        let norm = normalise(Path::new(piece));
        if !roots.iter().any(|r| paths_equal(r, &norm)) {
            roots.push(norm);
        }
    }
    if roots.is_empty() {
        return Err(AgentError::Config(format!(
            "no watch directories found in {:?}",
            raw
        )));
    }
    Ok(roots)
}

/// Hostname as used in object keys. Separators would corrupt the key
/// layout, so they are replaced; everything else passes through.
pub fn sanitise_hostname(host: &str) -> String {
    let cleaned = host.trim().replace(['/', '\\'], "-");
    if cleaned.is_empty() {
        "unknown-host".to_string()
    } else {
        cleaned
    }
}

/// Hostname of this machine, sanitised for key use.
pub fn local_hostname() -> String {
    let raw = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    sanitise_hostname(&raw)
}

/// Derive the object key for a file under one of the watch roots:
/// `<hostname>/<path relative to the first containing root>`. Fails when
/// the file sits outside every root.
pub fn object_key(roots: &[String], file_path: &str, host: &str) -> Result<String> {
    for root in roots {
        if is_under(root, file_path) {
            let root = root.trim_end_matches('/');
            let relative = file_path[root.len()..].trim_start_matches('/');
            if relative.is_empty() {
                break;
            }
            return Ok(format!("{}/{}", sanitise_hostname(host), relative));
        }
    }
    Err(AgentError::PathOutsideRoot(file_path.to_string()))
}

/// Public URL for a stored object. Path-style places the bucket in the
/// path, virtual-host style in the authority.
pub fn build_download_url(
    endpoint: &str,
    bucket: &str,
    key: &str,
    force_path_style: bool,
    disable_ssl: bool,
) -> String {
    let scheme = if disable_ssl { "http" } else { "https" };
    let host = endpoint
        .trim_end_matches('/')
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    if force_path_style {
        format!("{}://{}/{}/{}", scheme, host, bucket, key)
    } else {
        format!("{}://{}.{}/{}", scheme, bucket, host, key)
    }
}
