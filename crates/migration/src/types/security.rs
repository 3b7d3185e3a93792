//! Security tag and identifier system URIs.

use serde_json::Value;

/// `meta.security` system marking the owner of a resource.
pub const OWNER_SYSTEM: &str = "https://www.icanbwell.com/owner";

/// `meta.security` system carrying the source assigning authority.
pub const SOURCE_ASSIGNING_AUTHORITY_SYSTEM: &str =
    "https://www.icanbwell.com/sourceAssigningAuthority";

/// `meta.security` system carrying the connection type a resource arrived through.
pub const CONNECTION_TYPE_SYSTEM: &str = "https://www.icanbwell.com/connectionType";

/// Identifier/extension system duplicating a resource's source id.
pub const SOURCE_ID_SYSTEM: &str = "https://www.icanbwell.com/sourceId";

/// Identifier/extension system duplicating a resource's uuid.
pub const UUID_SYSTEM: &str = "https://www.icanbwell.com/uuid";

/// Returns the code of the first `meta.security` entry with the given system.
pub fn security_code<'a>(resource: &'a Value, system: &str) -> Option<&'a str> {
    resource
        .pointer("/meta/security")?
        .as_array()?
        .iter()
        .find(|tag| tag.get("system").and_then(Value::as_str) == Some(system))
        .and_then(|tag| tag.get("code"))
        .and_then(Value::as_str)
}

/// Returns true if the resource carries a `meta.security` entry with this system and code.
pub fn has_security_tag(resource: &Value, system: &str, code: &str) -> bool {
    resource
        .pointer("/meta/security")
        .and_then(Value::as_array)
        .is_some_and(|tags| {
            tags.iter().any(|tag| {
                tag.get("system").and_then(Value::as_str) == Some(system)
                    && tag.get("code").and_then(Value::as_str) == Some(code)
            })
        })
}

/// Resolves a resource's source assigning authority.
///
/// Prefers the explicit `_sourceAssigningAuthority` field, then the
/// source-assigning-authority security tag. A resource with neither has an
/// empty authority, which is a valid state.
pub fn source_assigning_authority(resource: &Value) -> String {
    if let Some(authority) = resource
        .get("_sourceAssigningAuthority")
        .and_then(Value::as_str)
        .filter(|a| !a.is_empty())
    {
        return authority.to_string();
    }
    security_code(resource, SOURCE_ASSIGNING_AUTHORITY_SYSTEM)
        .unwrap_or_default()
        .to_string()
}
