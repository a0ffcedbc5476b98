//! Object-key component sanitization.
//!
//! Dataset names come from the remote source and may contain anything.
//! Keys must stay single path components, readable in storage browsers and
//! safe to download on any platform, while keeping non-ASCII text intact.

/// Characters that break paths or downloads on common platforms.
const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*', '#', '%', '+'];

/// Longest component kept, in characters.
pub const MAX_COMPONENT_CHARS: usize = 100;

/// Turn `input` into a single object-key component.
///
/// Control characters, whitespace runs and path-breaking characters become a
/// single `_`. Dot runs collapse to one dot, so `..` never survives. Leading
/// and trailing dots, dashes and underscores are dropped.
/// Returns `"unnamed"` when nothing is left.
pub fn sanitize_key_component(input: &str) -> String {
    let mut result = String::with_capacity(input.len().min(MAX_COMPONENT_CHARS * 4));
    let mut last_was_replacement = false;

    for c in input.chars().take(MAX_COMPONENT_CHARS * 2) {
        if c.is_control() || c.is_whitespace() || INVALID_CHARS.contains(&c) {
            if !last_was_replacement {
                result.push('_');
                last_was_replacement = true;
            }
        } else if c == '.' && result.ends_with('.') {
            continue;
        } else {
            result.push(c);
            last_was_replacement = false;
        }
    }

    let trimmed: String = result
        .trim_matches(|c| c == '_' || c == '.' || c == '-')
        .chars()
        .take(MAX_COMPONENT_CHARS)
        .collect();
    let trimmed = trimmed.trim_end_matches(['_', '.', '-']);

    if trimmed.is_empty() {
        return "unnamed".to_string();
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_string() {
        assert_eq!(sanitize_key_component(""), "unnamed");
        assert_eq!(sanitize_key_component("   "), "unnamed");
        assert_eq!(sanitize_key_component("../.."), "unnamed");
    }

    #[test]
    fn test_whitespace_and_separators() {
        assert_eq!(sanitize_key_component("CT Chest  w/ contrast"), "CT_Chest_w_contrast");
        assert_eq!(sanitize_key_component("a\\b:c"), "a_b_c");
        assert_eq!(sanitize_key_component("50% dose"), "50_dose");
    }

    #[test]
    fn test_control_characters() {
        assert_eq!(sanitize_key_component("hello\x00world"), "hello_world");
        assert_eq!(sanitize_key_component("tab\tsep"), "tab_sep");
    }

    #[test]
    fn test_unicode_preserved() {
        assert_eq!(sanitize_key_component("胸部 CT"), "胸部_CT");
        assert_eq!(sanitize_key_component("Schädel"), "Schädel");
    }

    #[test]
    fn test_dot_runs_collapse() {
        assert_eq!(sanitize_key_component("x/../y"), "x_._y");
        assert_eq!(sanitize_key_component("1.2.840"), "1.2.840");
    }

    #[test]
    fn test_length_is_capped() {
        let long = "x".repeat(500);
        assert_eq!(sanitize_key_component(&long).chars().count(), MAX_COMPONENT_CHARS);
    }

    #[test]
    fn test_idempotency() {
        for input in ["hello?world", "  CT / MR  ", "...dots...", "胸部 CT"] {
            let once = sanitize_key_component(input);
            assert_eq!(once, sanitize_key_component(&once), "input: {input}");
        }
    }
}
