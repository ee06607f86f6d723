/// Broker topic for one device channel.
pub fn topic_name(group: &str, device: &str, channel: &str) -> Option<String> {
    let parts = [group, device, channel];
    if parts.iter().any(|p| p.is_empty() || p.contains('.')) {
        return None;
    }
    Some(parts.join("."))
}

/// Topic for a request path of the form `/<group>/<device>/<channel>`.
///
/// Any other shape is rejected.
pub fn topic_from_path(path: &str) -> Option<String> {
    let path = path.split('?').next().unwrap_or_default();
    let mut segments = path.trim_start_matches('/').split('/');
    match (segments.next(), segments.next(), segments.next(), segments.next()) {
        (Some(group), Some(device), Some(channel), None) => topic_name(group, device, channel),
        _ => None,
    }
}
