//! Minimal Cloud Storage XML API documents.
//!
//! The verifier reads and the emulator writes only a handful of tiny
//! documents (location, storage class, bucket ACL, errors), so they are built
//! with `format!` and read with plain string scanning.

use crate::{
    errors::xml_escape,
    models::bucket::{ALL_AUTHENTICATED_USERS, ALL_USERS, Binding, Policy},
};

/// Text of the first `<tag>…</tag>` element, unescaped.
pub fn element_text(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let len = xml[start..].find(&close)?;
    Some(xml_unescape(xml[start..start + len].trim()))
}

/// Every `<tag>…</tag>` block, inner content only.
fn blocks<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut out = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        let body = &rest[start + open.len()..];
        let Some(end) = body.find(&close) else {
            break;
        };
        out.push(&body[..end]);
        rest = &body[end + close.len()..];
    }
    out
}

fn attribute(xml: &str, name: &str) -> Option<String> {
    let marker = format!("{name}=\"");
    let start = xml.find(&marker)? + marker.len();
    let len = xml[start..].find('"')?;
    Some(xml_unescape(&xml[start..start + len]))
}

fn xml_unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

pub fn location_xml(location: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><LocationConstraint>{}</LocationConstraint>"#,
        xml_escape(location)
    )
}

pub fn storage_class_xml(storage_class: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><StorageClass>{}</StorageClass>"#,
        xml_escape(storage_class)
    )
}

/// Convert a bucket ACL document into policy bindings.
///
/// Entries are grouped by permission, keeping first-seen order.
pub fn policy_from_acl_xml(xml: &str) -> Policy {
    let mut bindings: Vec<Binding> = Vec::new();
    for entry in blocks(xml, "Entry") {
        let Some(permission) = element_text(entry, "Permission") else {
            continue;
        };
        let Some(member) = member_from_scope(entry) else {
            continue;
        };
        match bindings.iter_mut().find(|b| b.role == permission) {
            Some(binding) => binding.members.push(member),
            None => bindings.push(Binding::new(permission, [member])),
        }
    }
    Policy { bindings }
}

fn member_from_scope(entry: &str) -> Option<String> {
    let scope_type = attribute(entry, "type")?;
    let member = match scope_type.as_str() {
        "AllUsers" => ALL_USERS.to_string(),
        "AllAuthenticatedUsers" => ALL_AUTHENTICATED_USERS.to_string(),
        "UserByEmail" => format!("user:{}", element_text(entry, "EmailAddress")?),
        "GroupByEmail" => format!("group:{}", element_text(entry, "EmailAddress")?),
        "GroupByDomain" => format!("domain:{}", element_text(entry, "Domain")?),
        "UserById" => format!("user:{}", element_text(entry, "ID")?),
        "GroupById" => format!("group:{}", element_text(entry, "ID")?),
        _ => return None,
    };
    Some(member)
}

/// Render policy bindings as a bucket ACL document.
pub fn policy_to_acl_xml(policy: &Policy) -> String {
    let mut xml = String::from(
        r#"<?xml version="1.0" encoding="UTF-8"?><AccessControlList><Entries>"#,
    );
    for binding in &policy.bindings {
        let permission = permission_for_role(&binding.role);
        for member in &binding.members {
            xml.push_str("<Entry>");
            xml.push_str(&scope_for_member(member));
            xml.push_str(&format!("<Permission>{permission}</Permission>"));
            xml.push_str("</Entry>");
        }
    }
    xml.push_str("</Entries></AccessControlList>");
    xml
}

fn permission_for_role(role: &str) -> &'static str {
    match role {
        "roles/storage.admin" | "roles/storage.objectAdmin" | "FULL_CONTROL" | "OWNER" => {
            "FULL_CONTROL"
        }
        "roles/storage.objectCreator" | "roles/storage.legacyBucketWriter" | "WRITE"
        | "WRITER" => "WRITE",
        _ => "READ",
    }
}

fn scope_for_member(member: &str) -> String {
    if member == ALL_USERS {
        return r#"<Scope type="AllUsers"/>"#.to_string();
    }
    if member == ALL_AUTHENTICATED_USERS {
        return r#"<Scope type="AllAuthenticatedUsers"/>"#.to_string();
    }
    let (kind, value) = member.split_once(':').unwrap_or(("user", member));
    match kind {
        "group" => format!(
            r#"<Scope type="GroupByEmail"><EmailAddress>{}</EmailAddress></Scope>"#,
            xml_escape(value)
        ),
        "domain" => format!(
            r#"<Scope type="GroupByDomain"><Domain>{}</Domain></Scope>"#,
            xml_escape(value)
        ),
        _ => format!(
            r#"<Scope type="UserByEmail"><EmailAddress>{}</EmailAddress></Scope>"#,
            xml_escape(value)
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACL: &str = r#"<?xml version='1.0' encoding='UTF-8'?>
<AccessControlList>
  <Owner><ID>00b4903a97</ID></Owner>
  <Entries>
    <Entry><Scope type="GroupById"><ID>00b4903a97owners</ID></Scope><Permission>FULL_CONTROL</Permission></Entry>
    <Entry><Scope type="UserByEmail"><EmailAddress>uploader@eventhub.iam.gserviceaccount.com</EmailAddress></Scope><Permission>WRITE</Permission></Entry>
    <Entry><Scope type="AllUsers"/><Permission>READ</Permission></Entry>
  </Entries>
</AccessControlList>"#;

    #[test]
    fn reads_element_text() {
        let xml = location_xml("ASIA-SOUTH1");
        assert_eq!(element_text(&xml, "LocationConstraint").as_deref(), Some("ASIA-SOUTH1"));
        assert_eq!(element_text(&xml, "StorageClass"), None);
    }

    #[test]
    fn acl_entries_become_bindings() {
        let policy = policy_from_acl_xml(ACL);
        assert_eq!(policy.bindings.len(), 3);
        assert_eq!(policy.bindings[0].members, vec!["group:00b4903a97owners"]);
        assert_eq!(policy.bindings[2], Binding::new("READ", [ALL_USERS]));
        assert!(policy.is_public_readable());
    }

    #[test]
    fn rendered_acl_reads_back() {
        let policy = Policy {
            bindings: vec![
                Binding::new("roles/storage.objectViewer", [ALL_AUTHENTICATED_USERS]),
                Binding::new("roles/storage.objectAdmin", ["user:ops@eventhub.dev"]),
            ],
        };
        let read_back = policy_from_acl_xml(&policy_to_acl_xml(&policy));
        assert_eq!(
            read_back.bindings,
            vec![
                Binding::new("READ", [ALL_AUTHENTICATED_USERS]),
                Binding::new("FULL_CONTROL", ["user:ops@eventhub.dev"]),
            ]
        );
        assert!(read_back.is_public_readable());
        assert!(!policy_from_acl_xml(&policy_to_acl_xml(&Policy::private())).is_public_readable());
    }
}
