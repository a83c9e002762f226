//! Allow-list validation for values interpolated into AWS CLI arguments.
//!
//! Everything that ends up inside a `--filters`, `--query` or `--parameters`
//! argument goes through one of these checks first, including values that
//! came back from a previous query.

use regex::Regex;
use std::sync::LazyLock;

use crate::error::TunnelError;

static PROFILE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._\-]+$").unwrap());
static PATTERN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._\-*]+$").unwrap());
static SECRET_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._\-/]+$").unwrap());
static REGION_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-z]{2}(-[a-z]+)+-\d+$").unwrap());
static INSTANCE_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^i-[0-9a-f]{8,17}$").unwrap());
static HOSTNAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9\-.]{0,251}[A-Za-z0-9])?$").unwrap()
});

fn check(re: &Regex, field: &'static str, value: &str) -> Result<(), TunnelError> {
    if re.is_match(value) {
        Ok(())
    } else {
        Err(TunnelError::validation(field, value))
    }
}

/// Identity profile name
pub fn profile(value: &str) -> Result<(), TunnelError> {
    check(&PROFILE_RE, "profile", value)
}

/// Name-tag or identifier search pattern (`*` allowed)
pub fn search_pattern(value: &str) -> Result<(), TunnelError> {
    check(&PATTERN_RE, "search pattern", value)
}

pub fn secret_prefix(value: &str) -> Result<(), TunnelError> {
    check(&SECRET_PREFIX_RE, "secret prefix", value)
}

pub fn region(value: &str) -> Result<(), TunnelError> {
    check(&REGION_RE, "region", value)
}

/// EC2 instance id: `i-` plus 8 or 17 hex digits
pub fn instance_id(value: &str) -> Result<(), TunnelError> {
    check(&INSTANCE_ID_RE, "instance id", value)
}

pub fn hostname(value: &str) -> Result<(), TunnelError> {
    check(&HOSTNAME_RE, "hostname", value)
}

/// "Nothing found" output from the AWS CLI text formatter
pub fn is_none_sentinel(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") || trimmed.eq_ignore_ascii_case("null")
}
