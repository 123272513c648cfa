//! Clause operator registry.
//!
//! Every operator is a binary predicate over JSON values. Lookup is by wire
//! name; an unknown name yields no function and the clause reports a miss.

use chrono::DateTime;
use once_cell::sync::Lazy;
use semver::Version;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::warn;

pub type OpFn = fn(&Value, &Value) -> bool;

/// Find the predicate for an operator name.
pub fn lookup(op: &str) -> Option<OpFn> {
    Some(match op {
        "in" => op_in,
        "startsWith" => op_starts_with,
        "endsWith" => op_ends_with,
        "contains" => op_contains,
        "matches" => op_matches,
        "lessThan" => op_less_than,
        "lessThanOrEqual" => op_less_than_or_equal,
        "greaterThan" => op_greater_than,
        "greaterThanOrEqual" => op_greater_than_or_equal,
        "before" => op_before,
        "after" => op_after,
        "semVerEqual" => op_sem_ver_equal,
        "semVerLessThan" => op_sem_ver_less_than,
        "semVerGreaterThan" => op_sem_ver_greater_than,
        _ => return None,
    })
}

/// Log an unknown operator once per name for the process lifetime.
pub(crate) fn warn_unknown(op: &str) {
    static SEEN: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

    let mut seen = match SEEN.lock() {
        Ok(seen) => seen,
        Err(poisoned) => poisoned.into_inner(),
    };
    if seen.insert(op.to_string()) {
        warn!(%op, "unknown clause operator, treating as non-match");
    }
}

fn strings<'a>(uvalue: &'a Value, cvalue: &'a Value) -> Option<(&'a str, &'a str)> {
    Some((uvalue.as_str()?, cvalue.as_str()?))
}

fn numbers(uvalue: &Value, cvalue: &Value) -> Option<(f64, f64)> {
    Some((uvalue.as_f64()?, cvalue.as_f64()?))
}

fn op_in(uvalue: &Value, cvalue: &Value) -> bool {
    uvalue == cvalue
}

fn op_starts_with(uvalue: &Value, cvalue: &Value) -> bool {
    strings(uvalue, cvalue).map_or(false, |(u, c)| u.starts_with(c))
}

fn op_ends_with(uvalue: &Value, cvalue: &Value) -> bool {
    strings(uvalue, cvalue).map_or(false, |(u, c)| u.ends_with(c))
}

fn op_contains(uvalue: &Value, cvalue: &Value) -> bool {
    strings(uvalue, cvalue).map_or(false, |(u, c)| u.contains(c))
}

fn op_matches(uvalue: &Value, cvalue: &Value) -> bool {
    let (subject, pattern) = match strings(uvalue, cvalue) {
        Some(pair) => pair,
        None => return false,
    };
    match regex::Regex::new(pattern) {
        Ok(regex) => regex.is_match(subject),
        Err(error) => {
            warn!(%pattern, %error, "failed to compile clause regex");
            false
        }
    }
}

fn op_less_than(uvalue: &Value, cvalue: &Value) -> bool {
    numbers(uvalue, cvalue).map_or(false, |(u, c)| u < c)
}

fn op_less_than_or_equal(uvalue: &Value, cvalue: &Value) -> bool {
    numbers(uvalue, cvalue).map_or(false, |(u, c)| u <= c)
}

fn op_greater_than(uvalue: &Value, cvalue: &Value) -> bool {
    numbers(uvalue, cvalue).map_or(false, |(u, c)| u > c)
}

fn op_greater_than_or_equal(uvalue: &Value, cvalue: &Value) -> bool {
    numbers(uvalue, cvalue).map_or(false, |(u, c)| u >= c)
}

/// Interpret a temporal operand as fractional unix milliseconds. Numbers are
/// already in that unit; strings parse as RFC 3339 timestamps.
fn parse_time(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|dt| dt.timestamp_millis() as f64),
        _ => None,
    }
}

fn compare_time(uvalue: &Value, cvalue: &Value, op: fn(f64, f64) -> bool) -> bool {
    match (parse_time(uvalue), parse_time(cvalue)) {
        (Some(u), Some(c)) => op(u, c),
        _ => false,
    }
}

fn op_before(uvalue: &Value, cvalue: &Value) -> bool {
    compare_time(uvalue, cvalue, |u, c| u < c)
}

fn op_after(uvalue: &Value, cvalue: &Value) -> bool {
    compare_time(uvalue, cvalue, |u, c| u > c)
}

/// Parse a semantic version, tolerating a missing minor or patch component
/// by padding with zeros. Leading zeros and a leading `v` stay rejected.
fn parse_sem_ver(text: &str) -> Option<Version> {
    if let Ok(version) = Version::parse(text) {
        return Some(version);
    }

    // split the numeric core from any pre-release/build suffix
    let core_end = text.find(|c| c == '-' || c == '+').unwrap_or_else(|| text.len());
    let (core, suffix) = text.split_at(core_end);
    if core.is_empty() || !core.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }

    let padded = match core.matches('.').count() {
        0 => format!("{}.0.0{}", core, suffix),
        1 => format!("{}.0{}", core, suffix),
        _ => return None,
    };
    Version::parse(&padded).ok()
}

fn compare_sem_ver(
    uvalue: &Value,
    cvalue: &Value,
    op: fn(std::cmp::Ordering) -> bool,
) -> bool {
    let (u, c) = match strings(uvalue, cvalue) {
        Some(pair) => pair,
        None => return false,
    };
    match (parse_sem_ver(u), parse_sem_ver(c)) {
        (Some(u), Some(c)) => op(u.cmp_precedence(&c)),
        _ => false,
    }
}

fn op_sem_ver_equal(uvalue: &Value, cvalue: &Value) -> bool {
    compare_sem_ver(uvalue, cvalue, |ord| ord == std::cmp::Ordering::Equal)
}

fn op_sem_ver_less_than(uvalue: &Value, cvalue: &Value) -> bool {
    compare_sem_ver(uvalue, cvalue, |ord| ord == std::cmp::Ordering::Less)
}

fn op_sem_ver_greater_than(uvalue: &Value, cvalue: &Value) -> bool {
    compare_sem_ver(uvalue, cvalue, |ord| ord == std::cmp::Ordering::Greater)
}
