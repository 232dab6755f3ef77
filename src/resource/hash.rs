//! Spec hashing for change detection.
//!
//! The hash covers every input submitted to the provisioning API, so a stack
//! whose hash matches the last applied one needs no update call.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::types::StackSpec;

/// Hasher for computing stack input hashes.
#[derive(Debug, Default)]
pub struct SpecHasher;

impl SpecHasher {
    /// Creates a new spec hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the hash of a spec together with its effective tags and capabilities.
    #[must_use]
    pub fn hash_spec(
        &self,
        spec: &StackSpec,
        tags: &BTreeMap<String, String>,
        capabilities: &[String],
    ) -> String {
        let mut hasher = Sha256::new();

        update_field(&mut hasher, spec.stack_name.as_deref().unwrap_or_default());
        update_field(&mut hasher, spec.template.as_deref().unwrap_or_default());
        update_field(&mut hasher, spec.template_url.as_deref().unwrap_or_default());

        // BTreeMap iteration is already sorted
        for (key, value) in &spec.parameters {
            update_field(&mut hasher, key);
            update_field(&mut hasher, value);
        }
        hasher.update(b"|tags");
        for (key, value) in tags {
            update_field(&mut hasher, key);
            update_field(&mut hasher, value);
        }

        let mut capabilities: Vec<_> = capabilities.iter().collect();
        capabilities.sort_unstable();
        hasher.update(b"|capabilities");
        for capability in capabilities {
            update_field(&mut hasher, capability);
        }

        update_field(&mut hasher, spec.role_arn.as_deref().unwrap_or_default());

        let mut notification_arns: Vec<_> = spec.notification_arns.iter().collect();
        notification_arns.sort_unstable();
        hasher.update(b"|notifications");
        for arn in notification_arns {
            update_field(&mut hasher, arn);
        }

        update_field(&mut hasher, spec.on_failure.as_deref().unwrap_or_default());

        hex::encode(hasher.finalize())
    }

    /// Returns a short version of a hash for display.
    #[must_use]
    pub fn short_hash<'a>(&self, hash: &'a str) -> &'a str {
        hash.get(..8).unwrap_or(hash)
    }
}

/// Length-prefixes a field so adjacent fields cannot run together.
fn update_field(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_be_bytes());
    hasher.update(value.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_spec() -> StackSpec {
        StackSpec {
            template: Some(String::from("Resources: {}")),
            parameters: BTreeMap::from([(String::from("Env"), String::from("prod"))]),
            ..StackSpec::default()
        }
    }

    #[test]
    fn test_hash_deterministic() {
        let hasher = SpecHasher::new();
        let spec = test_spec();
        let tags = BTreeMap::new();

        let caps = vec![String::from("CAPABILITY_IAM"), String::from("CAPABILITY_AUTO_EXPAND")];
        let reordered = vec![String::from("CAPABILITY_AUTO_EXPAND"), String::from("CAPABILITY_IAM")];

        assert_eq!(
            hasher.hash_spec(&spec, &tags, &caps),
            hasher.hash_spec(&spec, &tags, &reordered)
        );
    }

    #[test]
    fn test_parameter_change_changes_hash() {
        let hasher = SpecHasher::new();
        let spec = test_spec();
        let mut changed = test_spec();
        changed
            .parameters
            .insert(String::from("Env"), String::from("staging"));

        let tags = BTreeMap::new();
        assert_ne!(
            hasher.hash_spec(&spec, &tags, &[]),
            hasher.hash_spec(&changed, &tags, &[])
        );
    }

    #[test]
    fn test_tag_change_changes_hash() {
        let hasher = SpecHasher::new();
        let spec = test_spec();
        let tags = BTreeMap::from([(String::from("team"), String::from("a"))]);
        let other = BTreeMap::from([(String::from("team"), String::from("b"))]);

        assert_ne!(
            hasher.hash_spec(&spec, &tags, &[]),
            hasher.hash_spec(&spec, &other, &[])
        );
    }

    #[test]
    fn test_short_hash() {
        let hasher = SpecHasher::new();
        assert_eq!(hasher.short_hash("abcdef1234567890"), "abcdef12");
        assert_eq!(hasher.short_hash("abc"), "abc");
    }
}
