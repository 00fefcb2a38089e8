//! Kubernetes helpers: client construction, name and label sanitization

use std::path::Path;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use crate::Error;

/// Maximum length of a DNS-1123 subdomain object name
pub const MAX_NAME_LENGTH: usize = 253;

/// Maximum length of a label value
pub const MAX_LABEL_VALUE_LENGTH: usize = 63;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients; longer than the watch timeout
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from an optional kubeconfig path, falling back to
/// in-cluster or inferred configuration
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Lowercase `input` and replace every character outside `[a-z0-9-.]` with
/// `-`, trimming separators from both ends.
pub fn sanitize_name(input: &str) -> String {
    let mapped: String = input
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    mapped
        .trim_matches(|c: char| c == '-' || c == '.')
        .to_string()
}

/// Make `input` usable as a label value: at most 63 characters from
/// `[A-Za-z0-9-_.]`, starting and ending alphanumeric.
///
/// Values that had to be altered get a short hash suffix so that distinct
/// inputs stay distinct.
pub fn label_value(input: &str) -> String {
    let valid = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.';
    if input.len() <= MAX_LABEL_VALUE_LENGTH
        && input.chars().all(valid)
        && input
            .chars()
            .next()
            .map_or(true, |c| c.is_ascii_alphanumeric())
        && input
            .chars()
            .last()
            .map_or(true, |c| c.is_ascii_alphanumeric())
    {
        return input.to_string();
    }

    let hash = &deterministic_hash(input)[..8];
    let cleaned: String = input
        .chars()
        .map(|c| if valid(c) { c } else { '-' })
        .collect();
    let mut prefix: String = cleaned
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .chars()
        .take(MAX_LABEL_VALUE_LENGTH - hash.len() - 1)
        .collect();
    while prefix.ends_with(|c: char| !c.is_ascii_alphanumeric()) {
        prefix.pop();
    }
    if prefix.is_empty() {
        hash.to_string()
    } else {
        format!("{}-{}", prefix, hash)
    }
}

/// Deterministic name of the status resource for one deployment of an app
///
/// `<app>-<deployment id>` when the id is already name-safe, otherwise the
/// sanitized id plus a short hash of the raw id.
pub fn status_name(app: &str, deployment_id: &str) -> String {
    let sanitized = sanitize_name(deployment_id);
    let suffix = if sanitized == deployment_id && !sanitized.is_empty() {
        sanitized
    } else if sanitized.is_empty() {
        deterministic_hash(deployment_id)[..8].to_string()
    } else {
        format!("{}-{}", sanitized, &deterministic_hash(deployment_id)[..8])
    };
    let full = format!("{}-{}", app, suffix);
    if full.len() <= MAX_NAME_LENGTH {
        return full;
    }
    let hash = deterministic_hash(&full);
    let keep = MAX_NAME_LENGTH - hash.len() - 1;
    let prefix = full[..keep].trim_end_matches(|c: char| c == '-' || c == '.');
    format!("{}-{}", prefix, hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_hash_is_stable_and_short() {
        assert_eq!(deterministic_hash("abc"), deterministic_hash("abc"));
        assert_ne!(deterministic_hash("abc"), deterministic_hash("abd"));
        assert_eq!(deterministic_hash("abc").len(), 16);
    }

    #[test]
    fn sanitize_name_lowercases_and_replaces() {
        assert_eq!(sanitize_name("Build_42"), "build-42");
        assert_eq!(sanitize_name("--x--"), "x");
        assert_eq!(sanitize_name("a.b-c"), "a.b-c");
    }

    #[test]
    fn label_value_keeps_valid_values() {
        assert_eq!(label_value("v1.2.3"), "v1.2.3");
        assert_eq!(label_value("Build_42"), "Build_42");
        assert_eq!(label_value(""), "");
    }

    #[test]
    fn label_value_fixes_invalid_values() {
        let fixed = label_value("sha256:abc/def");
        assert!(fixed.starts_with("sha256-abc-def-"));
        assert!(fixed.len() <= MAX_LABEL_VALUE_LENGTH);

        let long = "a".repeat(100);
        let fixed = label_value(&long);
        assert_eq!(fixed.len(), MAX_LABEL_VALUE_LENGTH);
        assert_ne!(label_value(&"a".repeat(101)), fixed);
    }

    /// Story: the status record name is a pure function of (app, deployment id)
    #[test]
    fn story_status_name_is_deterministic() {
        assert_eq!(status_name("web", "d1"), "web-d1");
        assert_eq!(status_name("web", "d1"), status_name("web", "d1"));

        let odd = status_name("web", "Build#7");
        assert!(odd.starts_with("web-build-7-"));
        assert_ne!(odd, status_name("web", "build-7"));

        let long = status_name("web", &"x".repeat(400));
        assert!(long.len() <= MAX_NAME_LENGTH);
    }
}
