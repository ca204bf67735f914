//! Non-negotiable safety filters enforced by the dispatcher before handing
//! a call to a tool (`spec.md` §4.8).

use std::path::{Component, Path, PathBuf};

const ALLOWED_ROOTS: [&str; 2] = ["/tmp", "/var/tmp"];
const PROTECTED_SUBDIRS: [&str; 4] = ["systemd", ".X11-unix", ".ICE-unix", ".Test-unix"];

/// Filesystem destination paths must canonically lie under `/tmp` or
/// `/var/tmp`. Rejects `..`, URL-encoded traversal, backslashes, and
/// protected subdirectories. Does not follow symlinks on disk (no
/// filesystem access is performed by this check); callers that need
/// symlink-escape protection should canonicalize via `std::fs::canonicalize`
/// on a path that has already passed this syntactic check.
pub fn check_filesystem_path(raw: &str) -> Result<PathBuf, String> {
    if raw.contains("..") {
        return Err("Path traversal detected: '..' segment".into());
    }
    let decoded = percent_decode(raw);
    if decoded.contains("..") {
        return Err("Path traversal detected: URL-encoded '..' segment".into());
    }
    if raw.contains('\\') {
        return Err("Path traversal detected: backslash not allowed".into());
    }

    let path = Path::new(raw);
    if !path.is_absolute() {
        return Err("destination path must be absolute".into());
    }

    for component in path.components() {
        if let Component::Normal(segment) = component {
            let segment = segment.to_string_lossy();
            if PROTECTED_SUBDIRS.iter().any(|p| *p == segment) {
                return Err(format!("protected subdirectory not allowed: {segment}"));
            }
        }
    }

    let under_allowed_root = ALLOWED_ROOTS.iter().any(|root| path.starts_with(root));
    if !under_allowed_root {
        return Err(format!(
            "destination must lie under one of {ALLOWED_ROOTS:?}"
        ));
    }

    Ok(path.to_path_buf())
}

fn percent_decode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(byte as char);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

const ALLOWED_VERBS: [&str; 5] = ["get", "describe", "logs", "top", "explain"];
const BLOCKED_RESOURCE_KINDS: [&str; 2] = ["secrets", "serviceaccounts"];
const IDENTITY_FLAGS: [&str; 4] = ["--kubeconfig", "--token", "--certificate", "--key"];
const SHELL_METACHARACTERS: [char; 9] = [';', '|', '&', '$', '`', '>', '<', '\n', '\\'];

/// Cluster-control tool arguments are sanitized: shell metacharacters are
/// stripped, verbs and resource kinds are allow-listed, and flags that
/// redirect identity (kubeconfig, token, certificate, key) are rejected.
pub fn check_cluster_control_args(args: &[String]) -> Result<Vec<String>, String> {
    if args.iter().any(|a| a.chars().any(|c| SHELL_METACHARACTERS.contains(&c))) {
        return Err("shell metacharacters are not allowed in cluster-control arguments".into());
    }

    let verb = args.first().ok_or("missing verb")?;
    if !ALLOWED_VERBS.contains(&verb.as_str()) {
        return Err(format!("verb '{verb}' is not allow-listed"));
    }

    if let Some(resource) = args.get(1) {
        let kind = resource.split('/').next().unwrap_or(resource);
        if BLOCKED_RESOURCE_KINDS.contains(&kind) {
            return Err(format!("resource kind '{kind}' is blocked"));
        }
    }

    for arg in args {
        if IDENTITY_FLAGS.iter().any(|flag| arg.starts_with(flag)) {
            return Err(format!("flag '{arg}' redirects identity and is not allowed"));
        }
    }

    Ok(args.to_vec())
}

/// Recursively replaces any substring that looks like a bearer token,
/// API key, or long hex/base64 secret in a JSON value's string leaves
/// with `REDACTED_TOKEN`, matching the normalised-error contract in
/// `spec.md` §4.8: tool error messages must never leak secrets.
pub fn redact_tokens(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(redact_string(s)),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(redact_tokens).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), redact_tokens(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

pub fn redact_string(s: &str) -> String {
    lazy_regex().replace_all(s, "REDACTED_TOKEN").to_string()
}

fn lazy_regex() -> &'static regex::Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(
            r"(?i)(?:bearer\s+[a-z0-9\-_.]{16,}|[a-z0-9]{32,}|sk-[a-z0-9]{20,})",
        )
        .unwrap()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_path_under_tmp() {
        assert!(check_filesystem_path("/tmp/report.json").is_ok());
        assert!(check_filesystem_path("/var/tmp/out.log").is_ok());
    }

    #[test]
    fn rejects_parent_traversal() {
        let err = check_filesystem_path("/tmp/../etc/passwd").unwrap_err();
        assert!(err.contains("traversal"));
    }

    #[test]
    fn rejects_url_encoded_traversal() {
        let err = check_filesystem_path("/tmp/%2e%2e/etc/passwd").unwrap_err();
        assert!(err.contains("traversal"));
    }

    #[test]
    fn rejects_outside_allowed_roots() {
        assert!(check_filesystem_path("/etc/passwd").is_err());
        assert!(check_filesystem_path("/home/user/.ssh/id_rsa").is_err());
    }

    #[test]
    fn rejects_protected_subdirectory() {
        let err = check_filesystem_path("/tmp/.X11-unix/X0").unwrap_err();
        assert!(err.contains("protected"));
    }

    #[test]
    fn cluster_control_allows_get_pods() {
        let args = vec!["get".to_string(), "pods".to_string()];
        assert!(check_cluster_control_args(&args).is_ok());
    }

    #[test]
    fn cluster_control_blocks_secrets() {
        let args = vec!["get".to_string(), "secrets".to_string()];
        let err = check_cluster_control_args(&args).unwrap_err();
        assert!(err.contains("blocked"));
    }

    #[test]
    fn cluster_control_blocks_identity_flags() {
        let args = vec!["get".to_string(), "pods".to_string(), "--token=abc".to_string()];
        let err = check_cluster_control_args(&args).unwrap_err();
        assert!(err.contains("identity"));
    }

    #[test]
    fn cluster_control_rejects_shell_metacharacters() {
        let args = vec!["get".to_string(), "pods; rm -rf /".to_string()];
        assert!(check_cluster_control_args(&args).is_err());
    }

    #[test]
    fn cluster_control_rejects_disallowed_verb() {
        let args = vec!["delete".to_string(), "pods".to_string()];
        assert!(check_cluster_control_args(&args).is_err());
    }

    #[test]
    fn redacts_bearer_token_in_nested_json() {
        let value = serde_json::json!({
            "error": "upstream call failed with header Bearer abcd1234efgh5678ijkl",
            "nested": { "detail": ["fine", "token sk-abcdefghijklmnopqrstuvwx leaked"] }
        });
        let redacted = redact_tokens(&value);
        let s = redacted.to_string();
        assert!(!s.contains("abcd1234efgh5678ijkl"));
        assert!(s.contains("REDACTED_TOKEN"));
    }
}
