// src/pattern/brace.rs

//! Brace expansion for glob patterns.
//!
//! `{a,b}` alternation plus numeric and alphabetic ranges (`{1..9}`,
//! `{a..f}`) are unrolled into plain globs before compilation. Expansion is
//! bounded: unrolling past the configured limit fails with
//! [`WatchError::ExpansionLimit`] instead of eating memory.

use crate::errors::WatchError;

/// Expand all brace groups in `pattern`, bounded by `limit`.
///
/// A pattern without braces comes back as a single-element vec. Nested
/// groups expand inside-out; alternatives multiply, which is exactly why the
/// limit exists.
pub fn expand(pattern: &str, limit: usize) -> Result<Vec<String>, WatchError> {
    let mut out = Vec::new();
    expand_into(pattern, limit, &mut out).map_err(|_| WatchError::ExpansionLimit {
        pattern: pattern.to_string(),
        limit,
    })?;
    Ok(out)
}

/// Marker error carried internally while unrolling; mapped to
/// `ExpansionLimit` with the original pattern at the top.
struct LimitExceeded;

fn expand_into(pattern: &str, limit: usize, out: &mut Vec<String>) -> Result<(), LimitExceeded> {
    let Some((prefix, body, suffix)) = first_group(pattern) else {
        if out.len() >= limit {
            return Err(LimitExceeded);
        }
        out.push(pattern.to_string());
        return Ok(());
    };

    for alt in alternatives(body)? {
        let candidate = format!("{prefix}{alt}{suffix}");
        expand_into(&candidate, limit, out)?;
    }
    Ok(())
}

/// Locate the first balanced `{...}` group.
///
/// Returns `(prefix, body, suffix)` or `None` when the pattern has no
/// balanced group. Unbalanced braces are left alone and treated literally.
fn first_group(pattern: &str) -> Option<(&str, &str, &str)> {
    let bytes = pattern.as_bytes();
    let open = pattern.find('{')?;

    let mut depth = 0usize;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some((&pattern[..open], &pattern[open + 1..i], &pattern[i + 1..]));
                }
            }
            _ => {}
        }
    }
    None
}

/// Alternatives inside one group body: a `..` range or a comma list.
fn alternatives(body: &str) -> Result<Vec<String>, LimitExceeded> {
    if let Some(range) = fill_range(body) {
        return Ok(range);
    }
    Ok(split_top_level(body))
}

/// Fill `{1..9}` / `{a..f}` ranges; `None` when the body is not a range.
fn fill_range(body: &str) -> Option<Vec<String>> {
    let (lo, hi) = body.split_once("..")?;
    if lo.is_empty() || hi.is_empty() || hi.contains("..") {
        return None;
    }

    // Numeric range, either direction.
    if let (Ok(a), Ok(b)) = (lo.parse::<i64>(), hi.parse::<i64>()) {
        let vals: Vec<String> = if a <= b {
            (a..=b).map(|v| v.to_string()).collect()
        } else {
            (b..=a).rev().map(|v| v.to_string()).collect()
        };
        return Some(vals);
    }

    // Single-character alphabetic range.
    let (a, b) = (single_ascii(lo)?, single_ascii(hi)?);
    let vals: Vec<String> = if a <= b {
        (a..=b).map(|c| (c as char).to_string()).collect()
    } else {
        (b..=a).rev().map(|c| (c as char).to_string()).collect()
    };
    Some(vals)
}

fn single_ascii(s: &str) -> Option<u8> {
    let mut chars = s.chars();
    let c = chars.next()?;
    if chars.next().is_some() || !c.is_ascii_alphabetic() {
        return None;
    }
    Some(c as u8)
}

/// Split a group body on commas that are not inside a nested group.
fn split_top_level(body: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;

    for c in body.chars() {
        match c {
            '{' => {
                depth += 1;
                current.push(c);
            }
            '}' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_pattern_passes_through() {
        assert_eq!(expand("src/*.rs", 10).unwrap(), vec!["src/*.rs"]);
    }

    #[test]
    fn alternation_expands() {
        assert_eq!(
            expand("*.{js,ts}", 10).unwrap(),
            vec!["*.js", "*.ts"]
        );
    }

    #[test]
    fn nested_groups_multiply() {
        assert_eq!(
            expand("{a,b{c,d}}", 10).unwrap(),
            vec!["a", "bc", "bd"]
        );
    }

    #[test]
    fn numeric_range_fills() {
        assert_eq!(
            expand("img{1..3}.png", 10).unwrap(),
            vec!["img1.png", "img2.png", "img3.png"]
        );
    }

    #[test]
    fn descending_numeric_range_fills() {
        assert_eq!(expand("{3..1}", 10).unwrap(), vec!["3", "2", "1"]);
    }

    #[test]
    fn alpha_range_fills() {
        assert_eq!(
            expand("{a..c}.log", 10).unwrap(),
            vec!["a.log", "b.log", "c.log"]
        );
    }

    #[test]
    fn limit_is_enforced() {
        let err = expand("{1..100}{1..100}", 1000).unwrap_err();
        match err {
            WatchError::ExpansionLimit { limit, .. } => assert_eq!(limit, 1000),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unbalanced_braces_stay_literal() {
        assert_eq!(expand("foo{bar", 10).unwrap(), vec!["foo{bar"]);
    }
}
