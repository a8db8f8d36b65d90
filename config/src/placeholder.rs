//! `%token%` placeholder expansion.
//!
//! Expansion runs in passes so a substituted value may itself contain
//! placeholders. Passes stop when the text stops changing or after
//! [`MAX_PLACEHOLDER_PASSES`]; whatever token text remains is the result.
//! Tokens the lookup does not know are left verbatim.

pub const MAX_PLACEHOLDER_PASSES: usize = 8;

pub(crate) fn resolve<F>(text: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut current = text.to_string();
    for _ in 0..MAX_PLACEHOLDER_PASSES {
        let next = substitute_once(&current, &lookup);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

/// One left-to-right pass over `text`.
fn substitute_once<F>(text: &str, lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find('%') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('%') else {
            out.push_str(&rest[open..]);
            return out;
        };

        let token = &after[..close];
        if let Some(value) = lookup(token) {
            out.push_str(&value);
            rest = &after[close + 1..];
        } else {
            // The closing `%` may open the next token.
            out.push('%');
            out.push_str(token);
            rest = &after[close..];
        }
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(token: &str) -> Option<String> {
        match token {
            "workspace_root" => Some("/ws".to_string()),
            "config:a" => Some("%config:b%".to_string()),
            "config:b" => Some("value".to_string()),
            "config:loop" => Some("%config:loop%!".to_string()),
            _ => None,
        }
    }

    #[test]
    fn test_plain_text_untouched() {
        assert_eq!(resolve("no tokens here", lookup), "no tokens here");
        assert_eq!(resolve("", lookup), "");
    }

    #[test]
    fn test_nested_values_resolve_across_passes() {
        assert_eq!(resolve("x=%config:a%", lookup), "x=value");
    }

    #[test]
    fn test_stray_percent_does_not_swallow_next_token() {
        assert_eq!(resolve("50% of %workspace_root%", lookup), "50% of /ws");
        assert_eq!(resolve("trailing %", lookup), "trailing %");
    }

    #[test]
    fn test_unknown_tokens_kept() {
        assert_eq!(
            resolve("%current_dir%/%workspace_root%", lookup),
            "%current_dir%//ws"
        );
    }

    #[test]
    fn test_growing_cycle_stops_at_cap() {
        let resolved = resolve("%config:loop%", lookup);
        assert!(resolved.starts_with("%config:loop%"));
        assert_eq!(
            resolved.matches('!').count(),
            MAX_PLACEHOLDER_PASSES
        );
    }

    #[test]
    fn test_multibyte_text_preserved() {
        assert_eq!(resolve("héllo %workspace_root% ✓", lookup), "héllo /ws ✓");
    }
}
