//! Account profile extraction from account metadata

use serde_json::Value;

use crate::db::schemas::Profile;

fn text_field(object: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    object
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Profile fields of an account metadata string
///
/// Returns `None` for malformed metadata or when none of the kept fields
/// are present.
pub fn parse_profile(json_metadata: &str) -> Option<Profile> {
    let Ok(Value::Object(root)) = serde_json::from_str::<Value>(json_metadata) else {
        return None;
    };

    let object = match root.get("profile") {
        Some(Value::Object(profile)) => profile,
        _ => &root,
    };

    let profile = Profile {
        location: text_field(object, "location"),
        about: text_field(object, "about"),
        name: text_field(object, "name"),
    };

    (!profile.is_empty()).then_some(profile)
}
