// src/path/mod.rs

//! Path normalization and classification.
//!
//! All matching and bookkeeping inside the engine happens on a canonical
//! forward-slash form, regardless of what separator the OS reports. Literal
//! inputs and glob inputs are told apart here, and glob inputs are split into
//! a literal subscription root plus a pattern remainder.

use std::path::{Path, PathBuf};

/// Characters that make a path segment a glob pattern.
const GLOB_META: &[char] = &['*', '?', '[', ']', '{', '}'];

/// Canonicalize a user input into forward-slash form.
///
/// - backslashes become `/`
/// - repeated slashes collapse, except a leading `//` (UNC-style prefix)
/// - a trailing slash is dropped (except for the root itself)
/// - relative inputs stay relative; no filesystem access happens here
pub fn normalize(input: &str) -> String {
    let unified = input.replace('\\', "/");

    let mut out = String::with_capacity(unified.len());
    let mut chars = unified.chars().peekable();

    // Preserve a UNC-style leading double slash.
    if unified.starts_with("//") && !unified.starts_with("///") {
        out.push_str("//");
        chars.next();
        chars.next();
    }

    let mut prev_slash = out.ends_with('/');
    for c in chars {
        if c == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(c);
    }

    while out.len() > 1 && out.ends_with('/') && !out.ends_with("//") {
        out.pop();
    }

    if out.is_empty() {
        ".".to_string()
    } else {
        out
    }
}

/// Strip a leading `!`, returning the remainder and whether it was negated.
pub fn split_negation(input: &str) -> (&str, bool) {
    match input.strip_prefix('!') {
        Some(rest) => (rest, true),
        None => (input, false),
    }
}

/// Does this input contain glob metacharacters?
///
/// A negation prefix alone does not make an input a glob.
pub fn is_glob(input: &str) -> bool {
    let (body, _) = split_negation(input);
    body.contains(GLOB_META)
}

/// The deepest ancestor of a glob pattern that is purely literal.
///
/// This is the directory the watcher actually subscribes on; the pattern
/// remainder is matched in-process. For a literal input the input itself is
/// returned.
///
/// ```
/// use watchtree::path::glob_parent;
/// assert_eq!(glob_parent("src/**/*.rs"), "src");
/// assert_eq!(glob_parent("*.txt"), ".");
/// assert_eq!(glob_parent("/var/log/app.log"), "/var/log/app.log");
/// ```
pub fn glob_parent(pattern: &str) -> String {
    let normalized = normalize(pattern);
    if !is_glob(&normalized) {
        return normalized;
    }

    let mut literal = String::new();
    for segment in normalized.split('/') {
        if segment.contains(GLOB_META) {
            break;
        }
        if !literal.is_empty() && literal != "/" {
            literal.push('/');
        }
        literal.push_str(segment);
        if literal.is_empty() {
            // Absolute pattern: the first segment is empty.
            literal.push('/');
        }
    }

    if literal.is_empty() {
        ".".to_string()
    } else {
        literal
    }
}

/// Resolve a (possibly relative) normalized input against an optional cwd.
pub fn absolutize(input: &str, cwd: Option<&Path>) -> PathBuf {
    let p = Path::new(input);
    if p.is_absolute() {
        return p.to_path_buf();
    }
    match cwd {
        Some(base) => base.join(p),
        None => std::env::current_dir()
            .map(|d| d.join(p))
            .unwrap_or_else(|_| p.to_path_buf()),
    }
}

/// Convert a path into a string relative to `root`, with forward slashes.
///
/// This is intentionally robust:
/// - First we try a direct `strip_prefix(root)`.
/// - If that fails (e.g. due to symlinks or different absolute prefixes),
///   we canonicalize both paths and try again.
/// - Only if both attempts fail do we give up.
///
/// Returns `None` if the path cannot be reasonably related to `root`.
pub fn relative_str(root: &Path, path: &Path) -> Option<String> {
    // Fast path: event path already starts with our root.
    if let Ok(rel) = path.strip_prefix(root) {
        return Some(to_slash(rel));
    }

    // More robust path: canonicalize both, then try again. This helps on
    // platforms (notably macOS) where different absolute prefixes may be used
    // for the same underlying directory (e.g. symlinks, /private/var/...).
    if let (Ok(root_canon), Ok(path_canon)) = (root.canonicalize(), path.canonicalize()) {
        if let Ok(rel) = path_canon.strip_prefix(&root_canon) {
            return Some(to_slash(rel));
        }
    }

    None
}

/// Forward-slash rendering of a path.
pub fn to_slash(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// The text a glob pattern is matched against.
///
/// Relative patterns compare against the path relative to `base` (the cwd
/// the pattern was written against); absolute patterns, marked by an empty
/// `base`, compare against the full forward-slash path.
pub fn match_text(base: &Path, path: &Path) -> Option<String> {
    if base.as_os_str().is_empty() {
        return Some(to_slash(path));
    }
    relative_str(base, path)
}

/// Basename of a normalized path string.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Is the basename a dotfile? Used by `atomic` mode to skip editor swap
/// files.
pub fn is_dotfile(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_slashes() {
        assert_eq!(normalize("a//b///c"), "a/b/c");
        assert_eq!(normalize("a\\b\\c"), "a/b/c");
        assert_eq!(normalize("/var//log/"), "/var/log");
        assert_eq!(normalize(""), ".");
    }

    #[test]
    fn normalize_preserves_unc_prefix() {
        assert_eq!(normalize("//server/share//x"), "//server/share/x");
    }

    #[test]
    fn glob_detection() {
        assert!(is_glob("src/**/*.rs"));
        assert!(is_glob("file.{js,ts}"));
        assert!(is_glob("photo?.png"));
        assert!(!is_glob("src/main.rs"));
        assert!(!is_glob("!src/main.rs"));
        assert!(is_glob("!src/*.rs"));
    }

    #[test]
    fn glob_parent_finds_literal_root() {
        assert_eq!(glob_parent("src/**/*.rs"), "src");
        assert_eq!(glob_parent("src/a/b/*.txt"), "src/a/b");
        assert_eq!(glob_parent("*.txt"), ".");
        assert_eq!(glob_parent("/var/log/*.log"), "/var/log");
        assert_eq!(glob_parent("plain/file.txt"), "plain/file.txt");
    }

    #[test]
    fn negation_split() {
        assert_eq!(split_negation("!foo"), ("foo", true));
        assert_eq!(split_negation("foo"), ("foo", false));
    }

    #[test]
    fn dotfile_detection() {
        assert!(is_dotfile(Path::new("/tmp/.swp")));
        assert!(!is_dotfile(Path::new("/tmp/file.txt")));
    }
}
