//! Represents a logical bucket and the access policy attached to it.

use serde::{Deserialize, Serialize};

/// Principal that matches every caller, signed in or not.
pub const ALL_USERS: &str = "allUsers";

/// Principal that matches any caller holding a Google identity.
pub const ALL_AUTHENTICATED_USERS: &str = "allAuthenticatedUsers";

/// Roles that grant read access to object payloads.
///
/// Covers IAM roles as well as the legacy ACL permissions the XML API reports.
const READ_GRANTING_ROLES: [&str; 9] = [
    "roles/storage.objectViewer",
    "roles/storage.legacyObjectReader",
    "roles/storage.legacyBucketReader",
    "roles/storage.objectAdmin",
    "roles/storage.admin",
    "READER",
    "READ",
    "FULL_CONTROL",
    "OWNER",
];

/// Location and storage class of a bucket.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BucketMetadata {
    /// Bucket name (must conform to DNS naming rules).
    pub name: String,

    /// Location constraint (e.g. "US", "ASIA-SOUTH1").
    pub location: String,

    /// Default storage class for new objects (e.g. STANDARD, NEARLINE).
    pub storage_class: String,
}

/// One role granted to a set of principals.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    pub role: String,
    pub members: Vec<String>,
}

impl Binding {
    pub fn new(role: impl Into<String>, members: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            role: role.into(),
            members: members.into_iter().map(Into::into).collect(),
        }
    }

    /// True when this binding's role lets its members read objects.
    pub fn grants_read(&self) -> bool {
        READ_GRANTING_ROLES
            .iter()
            .any(|role| role.eq_ignore_ascii_case(&self.role))
    }

    /// Public principals named by this binding.
    pub fn public_members(&self) -> impl Iterator<Item = &str> {
        self.members
            .iter()
            .map(String::as_str)
            .filter(|member| is_public_principal(member))
    }
}

/// Access policy of a bucket: an ordered set of principal→role bindings.
///
/// Deserializes from the JSON API `storage#policy` document; fields other
/// than `bindings` (etag, version, resourceId) are ignored.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Policy {
    #[serde(default)]
    pub bindings: Vec<Binding>,
}

impl Policy {
    /// A policy granting nothing to anyone outside the project.
    pub fn private() -> Self {
        Self::default()
    }

    /// A policy granting object read to `allUsers`.
    pub fn public_read() -> Self {
        Self {
            bindings: vec![Binding::new("roles/storage.objectViewer", [ALL_USERS])],
        }
    }

    /// Bindings that grant read access to a public principal.
    ///
    /// An empty result means the bucket is private.
    pub fn public_read_grants(&self) -> Vec<(&str, &str)> {
        self.bindings
            .iter()
            .filter(|binding| binding.grants_read())
            .flat_map(|binding| {
                binding
                    .public_members()
                    .map(move |member| (member, binding.role.as_str()))
            })
            .collect()
    }

    pub fn is_public_readable(&self) -> bool {
        !self.public_read_grants().is_empty()
    }

    /// This policy plus every grant of `other` it does not already hold.
    pub fn merged_with(mut self, other: &Policy) -> Policy {
        for binding in &other.bindings {
            match self.bindings.iter_mut().find(|b| b.role == binding.role) {
                Some(existing) => {
                    for member in &binding.members {
                        if !existing.members.contains(member) {
                            existing.members.push(member.clone());
                        }
                    }
                }
                None => self.bindings.push(binding.clone()),
            }
        }
        self
    }
}

/// Whether `member` is one of the wildcard principals.
pub fn is_public_principal(member: &str) -> bool {
    member == ALL_USERS || member == ALL_AUTHENTICATED_USERS
}
