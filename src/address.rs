//! `host:port` parsing shared by target and bind resolution

/// Split `host:port`, accepting `[v6-addr]:port` for IPv6 literals.
///
/// Returns `None` when the port is missing or not a valid `u16`, or the host
/// part is empty.
pub fn parse_host_port(s: &str) -> Option<(String, u16)> {
    let (host, port) = if let Some(rest) = s.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        (host, rest.strip_prefix(':')?)
    } else {
        let (host, port) = s.rsplit_once(':')?;
        // an unbracketed v6 literal is ambiguous
        if host.contains(':') {
            return None;
        }
        (host, port)
    };

    if host.is_empty() || port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let port = port.parse::<u16>().ok()?;
    Some((host.to_string(), port))
}

/// Inverse of [`parse_host_port`]
pub fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Bind addresses fall back to "whole string is the host, ephemeral port"
pub fn parse_bind(s: &str) -> (String, u16) {
    match parse_host_port(s) {
        Some(pair) => pair,
        None => (s.trim_start_matches('[').trim_end_matches(']').to_string(), 0),
    }
}
