use crate::client::ros_error::RosError;

/// Resolves a graph resource name (topic, node or parameter) to its global form: a leading `/`,
///  no trailing `/` and no empty segments. There are no namespaces below the root in this
///  client, so relative names are resolved against `/`.
pub fn resolve_name(name: &str) -> Result<String, RosError> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed == "/" {
        return Err(RosError::InvalidArgument(format!("invalid resource name {:?}", name)));
    }

    let mut resolved = String::with_capacity(trimmed.len() + 1);
    for segment in trimmed.trim_start_matches('~').split('/').filter(|s| !s.is_empty()) {
        if !is_valid_segment(segment) {
            return Err(RosError::InvalidArgument(format!("invalid resource name {:?}", name)));
        }
        resolved.push('/');
        resolved.push_str(segment);
    }

    if resolved.is_empty() {
        return Err(RosError::InvalidArgument(format!("invalid resource name {:?}", name)));
    }
    Ok(resolved)
}

fn is_valid_segment(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
