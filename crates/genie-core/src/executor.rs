//! Executor key registry shared by the stores and the CLI.

pub const DEFAULT_EXECUTOR_KEY: &str = "OPENCODE";

/// Canonical executor keys with their display labels.
pub const EXECUTORS: [(&str, &str); 8] = [
    ("GEMINI", "Google Gemini"),
    ("CODEX", "ChatGPT"),
    ("CLAUDE_CODE", "Claude"),
    ("CURSOR", "Cursor"),
    ("COPILOT", "GitHub Copilot"),
    ("OPENCODE", "OpenCode"),
    ("QWEN_CODE", "Qwen Code"),
    ("AMP", "Amp"),
];

const FRIENDLY_ALIASES: [(&str, &str); 2] = [("claude", "CLAUDE_CODE"), ("chatgpt", "CODEX")];

fn known_key(candidate: &str) -> Option<&'static str> {
    EXECUTORS
        .iter()
        .find(|(key, _)| *key == candidate)
        .map(|(key, _)| *key)
}

fn alias_key(candidate: &str) -> Option<&'static str> {
    FRIENDLY_ALIASES
        .iter()
        .find(|(alias, _)| *alias == candidate)
        .map(|(_, key)| *key)
}

/// Map a user- or file-supplied executor name onto a canonical key.
///
/// Returns `None` for blank input and for names that match no known executor.
pub fn normalize_executor_key(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(key) = known_key(&trimmed.to_uppercase()) {
        return Some(key.to_string());
    }

    let sanitized: String = trimmed
        .to_lowercase()
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .map(|ch| if ch == '-' { '_' } else { ch })
        .collect();
    if let Some(key) = known_key(&sanitized.to_uppercase()) {
        return Some(key.to_string());
    }

    alias_key(&sanitized)
        .or_else(|| alias_key(&trimmed.to_lowercase()))
        .map(|key| key.to_string())
}

pub fn normalize_executor_key_or_default(raw: Option<&str>, fallback: &str) -> String {
    raw.and_then(normalize_executor_key)
        .or_else(|| normalize_executor_key(fallback))
        .unwrap_or_else(|| DEFAULT_EXECUTOR_KEY.to_string())
}

pub fn executor_label(key: &str) -> &str {
    EXECUTORS
        .iter()
        .find(|(candidate, _)| *candidate == key)
        .map(|(_, label)| *label)
        .unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_separators_and_aliases() {
        assert_eq!(normalize_executor_key("opencode").as_deref(), Some("OPENCODE"));
        assert_eq!(
            normalize_executor_key("  claude-code ").as_deref(),
            Some("CLAUDE_CODE")
        );
        assert_eq!(normalize_executor_key("Qwen Code").as_deref(), Some("QWEN_CODE"));
        assert_eq!(normalize_executor_key("Claude").as_deref(), Some("CLAUDE_CODE"));
        assert_eq!(normalize_executor_key("chatgpt").as_deref(), Some("CODEX"));
    }

    #[test]
    fn blank_and_unknown_names_are_unrecognized() {
        assert_eq!(normalize_executor_key(""), None);
        assert_eq!(normalize_executor_key("   "), None);
        assert_eq!(normalize_executor_key("notepad"), None);
    }

    #[test]
    fn or_default_falls_back_in_order() {
        assert_eq!(
            normalize_executor_key_or_default(Some("codex"), "GEMINI"),
            "CODEX"
        );
        assert_eq!(
            normalize_executor_key_or_default(Some("bogus"), "gemini"),
            "GEMINI"
        );
        assert_eq!(normalize_executor_key_or_default(None, "bogus"), DEFAULT_EXECUTOR_KEY);
    }

    #[test]
    fn label_falls_back_to_key() {
        assert_eq!(executor_label("CODEX"), "ChatGPT");
        assert_eq!(executor_label("MYSTERY"), "MYSTERY");
    }
}
