//! Critical-path glob matching for risk assessment: `**` matches any
//! characters including `/`, `*` matches any characters except `/`, `?`
//! matches exactly one character. Matching is anchored against the full
//! path.

use glob::Pattern;

pub fn matches(pattern: &str, path: &str) -> bool {
    match Pattern::new(pattern) {
        Ok(p) => p.matches(path),
        Err(_) => false,
    }
}

pub fn any_matches(patterns: &[String], path: &str) -> bool {
    patterns.iter().any(|p| matches(p, path))
}
