// src/pattern/mod.rs

//! Compiled glob predicates.
//!
//! User patterns are brace-expanded (see [`brace`]) and compiled into
//! `globset` matchers. `*` never crosses a `/`; `**` does. Matching is
//! case-sensitive except on platforms whose filesystems are not.

pub mod brace;

use std::fmt;

use anyhow::{Context, Result};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::errors::WatchError;
use crate::path::split_negation;

/// Whether the host filesystem compares names case-insensitively.
pub fn platform_case_insensitive() -> bool {
    cfg!(any(target_os = "macos", target_os = "windows"))
}

/// One compiled user pattern.
///
/// Holds the original input for diagnostics and the expanded glob set for
/// matching against normalized relative paths.
#[derive(Clone)]
pub struct CompiledGlob {
    original: String,
    set: GlobSet,
}

impl fmt::Debug for CompiledGlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledGlob")
            .field("original", &self.original)
            .finish_non_exhaustive()
    }
}

impl CompiledGlob {
    /// Compile a single pattern with the given expansion bound.
    pub fn new(pattern: &str, expansion_limit: usize) -> Result<Self, WatchError> {
        let set = build_globset(&[pattern.to_string()], expansion_limit).map_err(|e| {
            // Preserve the expansion-limit class; everything else is an
            // invalid pattern.
            match e.downcast::<WatchError>() {
                Ok(limit_err) => limit_err,
                Err(other) => WatchError::InvalidArgument {
                    reason: format!("invalid glob '{pattern}': {other}"),
                },
            }
        })?;
        Ok(Self {
            original: pattern.to_string(),
            set,
        })
    }

    /// The pattern as the user wrote it.
    pub fn original(&self) -> &str {
        &self.original
    }

    /// Match against a normalized forward-slash path.
    pub fn matches(&self, rel_path: &str) -> bool {
        self.set.is_match(rel_path)
    }
}

/// A set of include patterns with `!`-negated carve-outs.
///
/// This is the shape the `ignored` option compiles into: a path is covered
/// when it matches any positive pattern and no negated one.
#[derive(Default, Clone)]
pub struct PatternSet {
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
}

impl fmt::Debug for PatternSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatternSet").finish_non_exhaustive()
    }
}

impl PatternSet {
    /// Compile a mixed list of plain and `!`-prefixed patterns.
    pub fn compile(patterns: &[String], expansion_limit: usize) -> Result<Self> {
        let mut positive = Vec::new();
        let mut negative = Vec::new();

        for raw in patterns {
            let (body, negated) = split_negation(raw);
            if negated {
                negative.push(body.to_string());
            } else {
                positive.push(body.to_string());
            }
        }

        let include = if positive.is_empty() {
            None
        } else {
            Some(build_globset(&positive, expansion_limit)?)
        };
        let exclude = if negative.is_empty() {
            None
        } else {
            Some(build_globset(&negative, expansion_limit)?)
        };

        Ok(Self { include, exclude })
    }

    /// True when the set has no patterns at all.
    pub fn is_empty(&self) -> bool {
        self.include.is_none() && self.exclude.is_none()
    }

    /// Does any positive pattern cover this path, without a negated
    /// carve-out?
    pub fn matches(&self, rel_path: &str) -> bool {
        let Some(include) = &self.include else {
            return false;
        };
        if !include.is_match(rel_path) {
            return false;
        }
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(rel_path) {
                return false;
            }
        }
        true
    }
}

/// Build a `GlobSet` from patterns, brace-expanding each first.
///
/// `*` and `?` do not cross path separators; `**` does. Case folding follows
/// the platform.
fn build_globset(patterns: &[String], expansion_limit: usize) -> Result<GlobSet> {
    let case_insensitive = platform_case_insensitive();
    let mut builder = GlobSetBuilder::new();

    for pattern in patterns {
        for expanded in brace::expand(pattern, expansion_limit)? {
            let glob = GlobBuilder::new(&expanded)
                .literal_separator(true)
                .case_insensitive(case_insensitive)
                .build()
                .with_context(|| format!("invalid glob pattern: {expanded}"))?;
            builder.add(glob);
        }
    }

    builder.build().context("building glob set")
}
