//! Session-aware navigation view.
//!
//! A pure function of the session: no user renders nothing, otherwise a
//! fixed, role-specific ordered link set. Routes are owned by the router;
//! this module only names them.

use crate::models::session::{Role, Session};
use serde::Serialize;

/// Entry route the application returns to after logout.
pub const ENTRY_ROUTE: &str = "/";

/// One navigation target.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct NavLink {
    pub label: &'static str,
    pub route: &'static str,
}

const fn link(label: &'static str, route: &'static str) -> NavLink {
    NavLink { label, route }
}

const PARTICIPANT_LINKS: [NavLink; 5] = [
    link("Dashboard", "/dashboard"),
    link("Browse Events", "/browse-events"),
    link("Clubs", "/clubs"),
    link("My Events", "/my-events"),
    link("Profile", "/profile"),
];

const ORGANIZER_LINKS: [NavLink; 3] = [
    link("Dashboard", "/dashboard"),
    link("My Events", "/organizer-events"),
    link("Profile", "/profile"),
];

const ADMIN_LINKS: [NavLink; 2] = [link("Dashboard", "/dashboard"), link("Admin Panel", "/admin")];

/// Ordered links for a role.
pub fn role_links(role: Role) -> &'static [NavLink] {
    match role {
        Role::Participant => &PARTICIPANT_LINKS,
        Role::Organizer => &ORGANIZER_LINKS,
        Role::Admin => &ADMIN_LINKS,
    }
}

/// Links to render for the current session; empty when signed out.
pub fn nav_links(session: &Session) -> &'static [NavLink] {
    match &session.user {
        Some(user) => role_links(user.role),
        None => &[],
    }
}

/// Rendered navigation bar.
#[derive(Serialize, Debug, PartialEq, Eq)]
pub struct NavBar {
    pub greeting: String,
    pub role: Role,
    pub links: Vec<NavLink>,
}

/// Render the bar, or `None` when there is no session.
pub fn render(session: &Session) -> Option<NavBar> {
    let user = session.user.as_ref()?;
    Some(NavBar {
        greeting: user.display_name().to_string(),
        role: user.role,
        links: role_links(user.role).to_vec(),
    })
}

impl Session {
    /// Clear all session state and return the route to navigate to.
    pub fn logout(&mut self) -> &'static str {
        *self = Session::anonymous();
        ENTRY_ROUTE
    }
}

impl std::fmt::Display for NavBar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Signed in as {} ({:?})", self.greeting, self.role)?;
        for link in &self.links {
            writeln!(f, "  {:<14} {}", link.label, link.route)?;
        }
        write!(f, "  {:<14} {}", "Logout", ENTRY_ROUTE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::session::{Profile, User};

    fn session(role: Role) -> Session {
        Session::signed_in(User {
            email: "someone@iiit.ac.in".into(),
            role,
            profile: None,
        })
    }

    fn routes(links: &[NavLink]) -> Vec<&'static str> {
        links.iter().map(|link| link.route).collect()
    }

    #[test]
    fn anonymous_session_renders_nothing() {
        assert!(nav_links(&Session::anonymous()).is_empty());
        assert!(render(&Session::anonymous()).is_none());
    }

    #[test]
    fn participant_links_in_order() {
        assert_eq!(
            routes(nav_links(&session(Role::Participant))),
            vec!["/dashboard", "/browse-events", "/clubs", "/my-events", "/profile"]
        );
    }

    #[test]
    fn organizer_sees_own_events_route() {
        let links = nav_links(&session(Role::Organizer));
        assert_eq!(routes(links), vec!["/dashboard", "/organizer-events", "/profile"]);
        assert!(!routes(links).contains(&"/admin"));
    }

    #[test]
    fn admin_links() {
        assert_eq!(
            routes(nav_links(&session(Role::Admin))),
            vec!["/dashboard", "/admin"]
        );
    }

    #[test]
    fn render_uses_profile_name() {
        let session = Session::signed_in(User {
            email: "org@iiit.ac.in".into(),
            role: Role::Organizer,
            profile: Some(Profile {
                name: Some("Robotics Club".into()),
            }),
        });
        let bar = render(&session).unwrap();
        assert_eq!(bar.greeting, "Robotics Club");
        assert!(bar.to_string().contains("/organizer-events"));
    }

    #[test]
    fn logout_clears_session_and_returns_entry() {
        let mut session = session(Role::Admin);
        assert_eq!(session.logout(), "/");
        assert!(!session.is_signed_in());
        assert!(nav_links(&session).is_empty());
    }
}
