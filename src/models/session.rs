//! Client-held session state for the navigation view.

use serde::{Deserialize, Serialize};

/// The closed set of account roles.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Participant,
    Organizer,
    Admin,
}

/// Optional profile details a user may have filled in.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Profile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A signed-in account.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub email: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<Profile>,
}

impl User {
    /// Name to greet the user with: the profile name, falling back to email.
    pub fn display_name(&self) -> &str {
        self.profile
            .as_ref()
            .and_then(|profile| profile.name.as_deref())
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.email)
    }
}

/// Session context threaded explicitly through the view layer.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Session {
    #[serde(default)]
    pub user: Option<User>,
}

impl Session {
    pub fn signed_in(user: User) -> Self {
        Self { user: Some(user) }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn is_signed_in(&self) -> bool {
        self.user.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_prefers_profile() {
        let user = User {
            email: "asha@iiit.ac.in".into(),
            role: Role::Participant,
            profile: Some(Profile {
                name: Some("Asha".into()),
            }),
        };
        assert_eq!(user.display_name(), "Asha");
    }

    #[test]
    fn display_name_falls_back_to_email() {
        let blank = User {
            email: "club@iiit.ac.in".into(),
            role: Role::Organizer,
            profile: Some(Profile {
                name: Some("  ".into()),
            }),
        };
        assert_eq!(blank.display_name(), "club@iiit.ac.in");

        let bare = User {
            profile: None,
            ..blank
        };
        assert_eq!(bare.display_name(), "club@iiit.ac.in");
    }

    #[test]
    fn session_json_round_trips_role_tag() {
        let raw = r#"{"user":{"email":"root@iiit.ac.in","role":"admin"}}"#;
        let session: Session = serde_json::from_str(raw).unwrap();
        assert_eq!(session.user.as_ref().map(|u| u.role), Some(Role::Admin));

        let empty: Session = serde_json::from_str("{}").unwrap();
        assert!(!empty.is_signed_in());
    }

    #[test]
    fn unknown_role_is_rejected() {
        let raw = r#"{"user":{"email":"x@y.z","role":"superuser"}}"#;
        assert!(serde_json::from_str::<Session>(raw).is_err());
    }
}
