//! NOXRUN Security Module
//!
//! Server-side validation of everything that crosses into a sandbox:
//! environment maps, dependency package names, workspace paths, image names.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;
use tracing::warn;

/// Environment map limits (per session).
pub const MAX_ENV_KEYS: usize = 64;
pub const MAX_ENV_BYTES: usize = 10 * 1024;

/// Shell-style identifier for environment keys.
static ENV_KEY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,127}$").unwrap());

/// PEP 503-ish package requirement: name, optional extras, optional version pin.
/// Deliberately rejects URLs, local paths and anything with separators.
static PACKAGE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[A-Za-z0-9][A-Za-z0-9._-]{0,63}(\[[A-Za-z0-9._,-]{1,64}\])?((==|>=|<=|~=|!=|>|<)[A-Za-z0-9.*+!_-]{1,32})?$",
    )
    .unwrap()
});

/// Patterns that must never appear in a workspace-relative path.
static PATH_TRAVERSAL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(^|/)\.\.(/|$)").unwrap(),
        Regex::new(r"\\").unwrap(),
        Regex::new(r"%2e%2e").unwrap(),
        Regex::new(r"//").unwrap(),
    ]
});

/// Why a validation failed; surfaced verbatim in `error_detail`.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub field: &'static str,
    pub reason: String,
}

impl Rejection {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self { field, reason: reason.into() }
    }
}

/// Validate a session environment map: key shape, key count, total size.
pub fn validate_env_map(env: &HashMap<String, String>) -> Result<(), Rejection> {
    if env.len() > MAX_ENV_KEYS {
        return Err(Rejection::new(
            "env",
            format!("environment map has {} keys, maximum is {}", env.len(), MAX_ENV_KEYS),
        ));
    }

    let mut total = 0usize;
    for (key, value) in env {
        if !ENV_KEY_PATTERN.is_match(key) {
            return Err(Rejection::new(
                "env",
                format!("environment key '{}' is not a valid identifier", key),
            ));
        }
        if value.contains('\0') {
            return Err(Rejection::new("env", format!("environment value for '{}' contains NUL", key)));
        }
        total += key.len() + value.len();
    }

    if total > MAX_ENV_BYTES {
        return Err(Rejection::new(
            "env",
            format!("environment map is {} bytes, maximum is {}", total, MAX_ENV_BYTES),
        ));
    }

    Ok(())
}

/// Validate a dependency package requirement string.
///
/// Rejects URLs, VCS references and path-shaped names outright; pip flags are
/// never caller-controlled, so a bare requirement is all we accept.
pub fn validate_package_name(pkg: &str) -> Result<(), Rejection> {
    let lowered = pkg.to_ascii_lowercase();
    if lowered.contains("://") || lowered.starts_with("git+") || lowered.starts_with('-') {
        warn!("Rejected package requirement with URL or flag: {}", pkg);
        return Err(Rejection::new(
            "dependencies",
            format!("package '{}' must be a plain requirement, not a URL or flag", pkg),
        ));
    }
    if pkg.contains('/') || pkg.contains('\\') || pkg.contains("..") {
        warn!("Rejected package requirement with path separators: {}", pkg);
        return Err(Rejection::new(
            "dependencies",
            format!("package '{}' must not contain path separators", pkg),
        ));
    }
    if !PACKAGE_PATTERN.is_match(pkg) {
        return Err(Rejection::new(
            "dependencies",
            format!("package '{}' is not a valid requirement", pkg),
        ));
    }
    Ok(())
}

/// Extract the bare distribution name from a requirement ("pandas==2.1" -> "pandas").
pub fn package_base_name(pkg: &str) -> &str {
    let end = pkg
        .find(|c| matches!(c, '=' | '>' | '<' | '~' | '!' | '['))
        .unwrap_or(pkg.len());
    &pkg[..end]
}

/// Validate a workspace-relative file path for upload/download.
pub fn validate_workspace_path(path: &str) -> Result<(), Rejection> {
    if path.is_empty() || path.len() > 512 {
        return Err(Rejection::new("path", "path must be 1-512 characters"));
    }
    if path.starts_with('/') {
        return Err(Rejection::new("path", "path must be workspace-relative, not absolute"));
    }
    if path.contains('\0') {
        return Err(Rejection::new("path", "path contains NUL"));
    }
    for pattern in PATH_TRAVERSAL_PATTERNS.iter() {
        if pattern.is_match(path) {
            warn!("Path traversal attempt rejected: {}", path);
            return Err(Rejection::new("path", "path contains traversal or non-canonical separators"));
        }
    }
    Ok(())
}

/// Validate a container image reference.
pub fn validate_image_name(image: &str) -> bool {
    if image.is_empty() || image.len() > 255 {
        return false;
    }
    let invalid_chars = ['$', '`', '|', ';', '&', '>', '<', '\\', '"', '\'', ' '];
    !image.chars().any(|c| invalid_chars.contains(&c))
}

/// Extract client IP from request headers (supports proxies).
pub fn extract_client_ip(
    forwarded_for: Option<&str>,
    real_ip: Option<&str>,
    remote_addr: Option<&str>,
) -> Option<String> {
    if let Some(xff) = forwarded_for {
        if let Some(first_ip) = xff.split(',').next() {
            let ip = first_ip.trim();
            if !ip.is_empty() {
                return Some(ip.to_string());
            }
        }
    }

    if let Some(real) = real_ip {
        if !real.is_empty() {
            return Some(real.to_string());
        }
    }

    remote_addr.map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_env_map_accepts_identifiers() {
        let env = env_of(&[("PYTHONPATH", "/workspace"), ("MY_VAR_2", "x")]);
        assert!(validate_env_map(&env).is_ok());
    }

    #[test]
    fn test_env_map_rejects_bad_key() {
        let env = env_of(&[("2BAD", "x")]);
        assert!(validate_env_map(&env).is_err());
        let env = env_of(&[("PATH=EVIL", "x")]);
        assert!(validate_env_map(&env).is_err());
    }

    #[test]
    fn test_env_map_rejects_too_many_keys() {
        let mut env = HashMap::new();
        for i in 0..65 {
            env.insert(format!("KEY_{}", i), "v".to_string());
        }
        assert!(validate_env_map(&env).is_err());
    }

    #[test]
    fn test_env_map_rejects_oversize() {
        let env = env_of(&[("BIG", &"x".repeat(MAX_ENV_BYTES))]);
        assert!(validate_env_map(&env).is_err());
    }

    #[test]
    fn test_package_accepts_plain_requirements() {
        assert!(validate_package_name("pandas").is_ok());
        assert!(validate_package_name("numpy==1.26.4").is_ok());
        assert!(validate_package_name("uvicorn[standard]>=0.29").is_ok());
        assert!(validate_package_name("scikit-learn").is_ok());
    }

    #[test]
    fn test_package_rejects_urls_and_paths() {
        assert!(validate_package_name("https://evil.example/pkg.whl").is_err());
        assert!(validate_package_name("git+https://evil.example/repo").is_err());
        assert!(validate_package_name("../../../etc/passwd").is_err());
        assert!(validate_package_name("--index-url=http://evil").is_err());
        assert!(validate_package_name("pkg; rm -rf /").is_err());
    }

    #[test]
    fn test_package_base_name() {
        assert_eq!(package_base_name("numpy==1.26.4"), "numpy");
        assert_eq!(package_base_name("uvicorn[standard]"), "uvicorn");
        assert_eq!(package_base_name("requests"), "requests");
    }

    #[test]
    fn test_workspace_path_accepts_relative() {
        assert!(validate_workspace_path("data/input.csv").is_ok());
        assert!(validate_workspace_path("out.bin").is_ok());
    }

    #[test]
    fn test_workspace_path_rejects_traversal() {
        assert!(validate_workspace_path("../secrets").is_err());
        assert!(validate_workspace_path("a/../../b").is_err());
        assert!(validate_workspace_path("/etc/passwd").is_err());
        assert!(validate_workspace_path("a\\b").is_err());
        assert!(validate_workspace_path("a//b").is_err());
        assert!(validate_workspace_path("").is_err());
    }

    #[test]
    fn test_validate_image_name() {
        assert!(validate_image_name("python:3.12-slim"));
        assert!(validate_image_name("registry.example.com/sandbox/python:3.12"));
        assert!(!validate_image_name("python; rm -rf /"));
        assert!(!validate_image_name(""));
    }

    #[test]
    fn test_extract_client_ip() {
        assert_eq!(
            extract_client_ip(Some("1.2.3.4, 5.6.7.8"), None, None),
            Some("1.2.3.4".to_string())
        );
        assert_eq!(extract_client_ip(None, Some("1.2.3.4"), None), Some("1.2.3.4".to_string()));
        assert_eq!(
            extract_client_ip(None, None, Some("1.2.3.4:12345")),
            Some("1.2.3.4:12345".to_string())
        );
    }
}
