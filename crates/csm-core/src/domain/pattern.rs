use lazy_static::lazy_static;
use regex::{Regex, RegexBuilder};

use crate::domain::coercion::to_display_string;
use crate::error::{CoreError, CoreResult};
use crate::types::{lookup_path, Context};

lazy_static! {
    static ref INTERPOLATION_REGEX: Regex = Regex::new(r"#\{([^}]+)\}").unwrap();
}

/// Whether a pattern gets a precompiled wildcard matcher
pub fn is_wildcard(pattern: &str) -> bool {
    pattern.contains('*') && !pattern.starts_with(':')
}

/// Compile a wildcard pattern into an anchored, case-insensitive regex.
///
/// `*` is the only metacharacter; everything else matches literally.
pub fn compile_wildcard(pattern: &str) -> CoreResult<Regex> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");

    RegexBuilder::new(&format!("^{}$", body))
        .case_insensitive(true)
        .build()
        .map_err(|e| CoreError::Other(format!("Invalid wildcard pattern '{}': {}", pattern, e)))
}

/// Replace `#{path}` references with context values.
///
/// Fails when a referenced variable is absent, so the caller can treat the
/// pattern as not matching.
pub fn interpolate(pattern: &str, context: &Context) -> CoreResult<String> {
    if !pattern.contains("#{") {
        return Ok(pattern.to_string());
    }

    let mut result = String::with_capacity(pattern.len());
    let mut last = 0;
    for captures in INTERPOLATION_REGEX.captures_iter(pattern) {
        let (whole, path) = match (captures.get(0), captures.get(1)) {
            (Some(whole), Some(path)) => (whole, path.as_str().trim()),
            _ => continue,
        };

        let value = lookup_path(context, path).ok_or_else(|| {
            CoreError::ExpressionError(format!("Interpolation variable '{}' not found in context", path))
        })?;

        result.push_str(&pattern[last..whole.start()]);
        result.push_str(&to_display_string(Some(value)));
        last = whole.end();
    }
    result.push_str(&pattern[last..]);

    Ok(result)
}
