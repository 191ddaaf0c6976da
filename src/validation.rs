//! Input validation for identifiers, drafts and endpoints

use once_cell::sync::Lazy;
use regex::Regex;

/// Maximum characters accepted in a text message draft.
pub const MAX_MESSAGE_CHARS: usize = 4000;

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:\-]{0,127}$").expect("identifier pattern compiles")
});

/// Validates a server-issued identifier (conversation, message, user, notification).
pub fn validate_identifier(kind: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{} id cannot be empty", kind));
    }

    if !IDENTIFIER.is_match(value) {
        return Err(format!("{} id '{}' contains invalid characters", kind, value));
    }

    Ok(())
}

/// Validates a message draft after sanitizing.
pub fn validate_message_content(text: &str) -> Result<(), String> {
    if text.trim().is_empty() {
        return Err("Message cannot be empty".to_string());
    }

    let chars = text.chars().count();
    if chars > MAX_MESSAGE_CHARS {
        return Err(format!(
            "Message too long ({} characters, max {})",
            chars, MAX_MESSAGE_CHARS
        ));
    }

    Ok(())
}

/// Strips NUL and control characters (newline and tab survive) and trims
/// surrounding whitespace.
pub fn sanitize_message_content(text: &str) -> String {
    text.chars()
        .filter(|&c| c == '\n' || c == '\t' || !c.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

/// Validates a push endpoint URL (`ws://` or `wss://` with a host).
pub fn validate_push_url(url: &str) -> Result<(), String> {
    if url.is_empty() {
        return Err("Push URL cannot be empty".to_string());
    }

    let rest = url
        .strip_prefix("wss://")
        .or_else(|| url.strip_prefix("ws://"))
        .ok_or_else(|| "Push URL must start with ws:// or wss://".to_string())?;

    let host = rest.split(['/', '?']).next().unwrap_or("");
    let hostname = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);
    if hostname.is_empty() {
        return Err("Push URL must include a host".to_string());
    }

    if let Some((_, port)) = host.rsplit_once(':') {
        let port_num = port
            .parse::<u16>()
            .map_err(|_| format!("Invalid port number: {}", port))?;
        if port_num == 0 {
            return Err("Port number must be greater than 0".to_string());
        }
    }

    Ok(())
}
