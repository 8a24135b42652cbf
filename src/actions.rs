use tracing::warn;

/// Longest wait a single action may request, in ms.
pub const MAX_WAIT_MS: u64 = 30_000;

/// Keys the executor knows how to type beyond single characters.
pub const KNOWN_KEYS: [&str; 7] = ["enter", "esc", "space", "backspace", "tab", "y", "n"];

/// One unit of agent intent, parsed from a model response line.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Thinking(String),
    /// Type text, then press enter.
    Line(String),
    /// Type text, no enter.
    Type(String),
    Key(String),
    Wait(u64),
    Memory(String),
    Disconnect(String),
}

/// Parse a model response into actions. Total: any line that does not carry
/// a recognized prefix is ignored, and a non-empty response that yields no
/// actions degrades to a harmless think-and-wait.
pub fn parse_actions(response: &str) -> Vec<Action> {
    let mut actions = Vec::new();

    for line in response.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((prefix, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        match prefix.trim().to_uppercase().as_str() {
            "THINKING" => actions.push(Action::Thinking(value.to_string())),
            "LINE" => actions.push(Action::Line(value.to_string())),
            "TYPE" => actions.push(Action::Type(value.to_string())),
            "KEY" => {
                let key = value.to_lowercase();
                // single characters only if they fit in one byte on the wire
                if KNOWN_KEYS.contains(&key.as_str()) || key.len() == 1 {
                    actions.push(Action::Key(key));
                } else {
                    warn!(key = %value, "dropping unrecognized key");
                }
            }
            "WAIT" => {
                let ms = value.parse::<u64>().unwrap_or(1000);
                actions.push(Action::Wait(ms.min(MAX_WAIT_MS)));
            }
            "MEMORY" => actions.push(Action::Memory(value.to_string())),
            "DISCONNECT" => actions.push(Action::Disconnect(value.to_string())),
            _ => {}
        }
    }

    if actions.is_empty() && !response.trim().is_empty() {
        actions.push(Action::Thinking("Could not determine what to do".to_string()));
        actions.push(Action::Wait(2000));
    }

    actions
}

/// Wire bytes for a named key.
pub fn key_bytes(key: &str) -> Vec<u8> {
    match key {
        "enter" => b"\r\n".to_vec(),
        "esc" => vec![0x1B],
        "space" => vec![0x20],
        "backspace" => vec![0x08],
        "tab" => vec![0x09],
        other => other.bytes().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_response() {
        let response = "THINKING: looking at a menu\n\
                        LINE: Hello world\n\
                        KEY: enter\n\
                        WAIT: 500\n\
                        WAIT: 99999\n\
                        KEY: ⌘\n\
                        MEMORY: noted";
        let actions = parse_actions(response);
        assert_eq!(
            actions,
            vec![
                Action::Thinking("looking at a menu".to_string()),
                Action::Line("Hello world".to_string()),
                Action::Key("enter".to_string()),
                Action::Wait(500),
                Action::Wait(30000),
                Action::Memory("noted".to_string()),
            ]
        );
    }

    #[test]
    fn test_prefixes_case_insensitive() {
        let actions = parse_actions("line: hi there\nkey: ENTER");
        assert_eq!(
            actions,
            vec![
                Action::Line("hi there".to_string()),
                Action::Key("enter".to_string()),
            ]
        );
    }

    #[test]
    fn test_single_char_key_accepted() {
        let actions = parse_actions("KEY: Q");
        assert_eq!(actions, vec![Action::Key("q".to_string())]);
    }

    #[test]
    fn test_multichar_unknown_key_dropped() {
        // the unknown key drops but the response is non-empty and had no
        // other valid actions, so the fallback kicks in
        let actions = parse_actions("KEY: uparrow");
        assert_eq!(
            actions,
            vec![
                Action::Thinking("Could not determine what to do".to_string()),
                Action::Wait(2000),
            ]
        );
    }

    #[test]
    fn test_unparseable_wait_defaults() {
        let actions = parse_actions("WAIT: soon");
        assert_eq!(actions, vec![Action::Wait(1000)]);
    }

    #[test]
    fn test_rambling_response_becomes_noop() {
        let actions = parse_actions("I think I should probably look around first.");
        assert_eq!(
            actions,
            vec![
                Action::Thinking("Could not determine what to do".to_string()),
                Action::Wait(2000),
            ]
        );
    }

    #[test]
    fn test_empty_response_yields_nothing() {
        assert!(parse_actions("").is_empty());
        assert!(parse_actions("  \n  ").is_empty());
    }

    #[test]
    fn test_key_bytes() {
        assert_eq!(key_bytes("enter"), b"\r\n");
        assert_eq!(key_bytes("esc"), vec![0x1B]);
        assert_eq!(key_bytes("q"), b"q");
    }
}
