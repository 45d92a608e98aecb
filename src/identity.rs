//! Sandbox naming conventions.
//!
//! A sandbox is identified by its namespace (`lab-<userId>`) and the name of the
//! workload inside it. Workload names are generated, never stored elsewhere.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of a cluster resource name.
pub const MAX_NAME_LEN: usize = 63;

/// Characters reserved for the `-<millis>-<suffix>` tail of a workload name.
const SUFFIX_HEX_LEN: usize = 8;

/// Coordinates of one sandbox workload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxRef {
    pub namespace: String,
    pub workload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

impl SandboxRef {
    pub fn new(namespace: impl Into<String>, workload: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            workload: workload.into(),
            container: None,
        }
    }

    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }
}

impl fmt::Display for SandboxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.workload)
    }
}

/// Keep only lowercase alphanumerics and hyphens.
pub fn sanitize(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect()
}

/// Generate a unique workload name for `user_id`.
///
/// Shape: `<prefix>-<user>-<unix millis>-<random hex>`. The user part is
/// truncated first so the timestamp and random suffix always survive the
/// 63-character limit.
pub fn workload_name(prefix: &str, user_id: &str) -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let random = uuid::Uuid::new_v4().simple().to_string();
    compose_workload_name(prefix, user_id, millis, &random[..SUFFIX_HEX_LEN])
}

fn compose_workload_name(prefix: &str, user_id: &str, millis: i64, suffix: &str) -> String {
    let tail = format!("{}-{}", millis, sanitize(suffix));
    let prefix = sanitize(prefix);
    let user = sanitize(user_id);

    let head_budget = MAX_NAME_LEN.saturating_sub(tail.len() + 1);
    let mut head: String = [prefix.as_str(), user.as_str()]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("-");
    head.truncate(head_budget);
    let head = head.trim_matches('-');

    let name = if head.is_empty() {
        tail
    } else {
        format!("{}-{}", head, tail)
    };

    let mut name = name.trim_start_matches('-').to_string();
    name.truncate(MAX_NAME_LEN);
    name.trim_end_matches('-').to_string()
}

/// Whether `name` satisfies the resource naming rules.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.ends_with('-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_names_follow_naming_rules() {
        for user in [
            "alice",
            "Bob_Smith@example.com",
            "---",
            "",
            "a-very-long-user-identifier-that-keeps-going-and-going-forever-and-ever",
            "ÜNÎCÖDÉ",
        ] {
            let name = workload_name("lab", user);
            assert!(is_valid_name(&name), "invalid name {:?} for user {:?}", name, user);
        }
    }

    #[test]
    fn names_differ_within_the_same_millisecond() {
        let a = compose_workload_name("lab", "alice", 1_700_000_000_000, "0a1b2c3d");
        let b = compose_workload_name("lab", "alice", 1_700_000_000_000, "ffee0011");
        assert_ne!(a, b);
        assert_eq!(a, "lab-alice-1700000000000-0a1b2c3d");

        let x = workload_name("lab", "alice");
        let y = workload_name("lab", "alice");
        assert_ne!(x, y);
    }

    #[test]
    fn long_user_ids_keep_the_unique_tail() {
        let user = "x".repeat(100);
        let a = compose_workload_name("lab", &user, 1_700_000_000_000, "aaaaaaaa");
        let b = compose_workload_name("lab", &user, 1_700_000_000_000, "bbbbbbbb");
        assert_eq!(a.len(), MAX_NAME_LEN);
        assert!(a.ends_with("-1700000000000-aaaaaaaa"));
        assert_ne!(a, b);
    }

    #[test]
    fn sanitize_strips_invalid_characters() {
        assert_eq!(sanitize("User.Name_01"), "username01");
        assert_eq!(sanitize("a-b"), "a-b");
    }

    #[test]
    fn validity_checks() {
        assert!(is_valid_name("lab-alice-1"));
        assert!(!is_valid_name("lab-alice-"));
        assert!(!is_valid_name("Lab"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name(&"a".repeat(64)));
    }
}
