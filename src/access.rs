use std::{collections::HashMap, path::PathBuf};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::fs::read_to_string;

use crate::identity::Identity;

/// Decides whether an identity may reach a target.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AccessPolicy: Send + Sync {
    async fn is_allowed(&self, identity: &Identity, target: &str) -> bool;
}

// A single grant from the policy document.
#[derive(Debug, PartialEq, Eq)]
enum TargetPattern<'a> {
    Any,
    Prefix(&'a str),
    Exact(&'a str),
}

impl<'a> From<&'a str> for TargetPattern<'a> {
    fn from(pattern: &'a str) -> Self {
        if pattern == "*" {
            TargetPattern::Any
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            TargetPattern::Prefix(prefix)
        } else {
            TargetPattern::Exact(pattern)
        }
    }
}

impl TargetPattern<'_> {
    fn matches(&self, target: &str) -> bool {
        match self {
            TargetPattern::Any => true,
            TargetPattern::Prefix(prefix) => target.starts_with(prefix),
            TargetPattern::Exact(exact) => target == *exact,
        }
    }
}

/// Access policy stored as a JSON object mapping identity ids to lists of target patterns:
///
/// ```json
/// {"alice": ["build-node", "staging-*"], "root": ["*"]}
/// ```
///
/// The file is read again on every decision, so edits apply to the next connection.
/// Anything that cannot be read or parsed denies access.
#[derive(Debug, Clone)]
pub struct FileAccessPolicy {
    path: PathBuf,
}

impl FileAccessPolicy {
    pub fn new(path: PathBuf) -> Self {
        FileAccessPolicy { path }
    }
}

#[async_trait]
impl AccessPolicy for FileAccessPolicy {
    async fn is_allowed(&self, identity: &Identity, target: &str) -> bool {
        let data = match read_to_string(&self.path).await {
            Ok(data) => data,
            Err(error) => {
                #[cfg(not(coverage_nightly))]
                tracing::error!(path = ?self.path, %error, "Unable to read access policy.");
                return false;
            }
        };
        let grants: HashMap<String, Vec<String>> = match serde_json::from_str(&data) {
            Ok(grants) => grants,
            Err(error) => {
                #[cfg(not(coverage_nightly))]
                tracing::error!(path = ?self.path, %error, "Unable to parse access policy.");
                return false;
            }
        };
        grants.get(&identity.id).is_some_and(|patterns| {
            patterns
                .iter()
                .any(|pattern| TargetPattern::from(pattern.as_str()).matches(target))
        })
    }
}
