//! Shell-style wildcard matching for whitelist rules.
//!
//! Patterns are anchored over the whole string: `*` matches any sequence
//! (including newlines), `?` matches one character, everything else is
//! literal. A trailing `" *"` also accepts the bare prefix, so the bash rule
//! `git *` covers `git`, `git status -sb`, and a `git` followed by a
//! newline, but not `git-foo`.

use regex::Regex;

/// Match `text` against a glob `pattern`. Patterns that fail to compile
/// never match.
pub fn match_wildcard(text: &str, pattern: &str) -> bool {
    let mut escaped = regex::escape(pattern)
        .replace(r"\*", ".*")
        .replace(r"\?", ".");

    if let Some(prefix) = escaped.strip_suffix(" .*") {
        escaped = format!("{prefix}( .*|$|\n)?");
    }

    match Regex::new(&format!("(?s)^{escaped}$")) {
        Ok(re) => re.is_match(text),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_star_matches_any_sequence() {
        assert!(match_wildcard("/workspace/src/main.go", "/workspace/**"));
        assert!(match_wildcard("anything at all", "*"));
        assert!(match_wildcard("", "*"));
        assert!(match_wildcard("multi\nline", "*"));
    }

    #[test]
    fn test_question_mark_matches_one_char() {
        assert!(match_wildcard("a.txt", "?.txt"));
        assert!(!match_wildcard("ab.txt", "?.txt"));
        assert!(!match_wildcard(".txt", "?.txt"));
    }

    #[test]
    fn test_anchored_whole_string() {
        assert!(!match_wildcard("prefix /workspace/a", "/workspace/*"));
        assert!(!match_wildcard("/workspace", "/workspace/*"));
    }

    #[test]
    fn test_regex_meta_is_literal() {
        assert!(match_wildcard("a+b", "a+b"));
        assert!(!match_wildcard("aab", "a+b"));
        assert!(match_wildcard("f(x)", "f(x)"));
    }

    #[test]
    fn test_trailing_space_star_sugar() {
        assert!(match_wildcard("git", "git *"));
        assert!(match_wildcard("git status", "git *"));
        assert!(match_wildcard("git status -sb", "git *"));
        assert!(match_wildcard("git\n", "git *"));
        assert!(!match_wildcard("git-foo", "git *"));
        assert!(!match_wildcard("gitk", "git *"));
    }

    #[test]
    fn test_invalid_pattern_never_matches() {
        // regex::escape neutralizes meta characters, so an un-compilable
        // pattern is hard to produce; the guard still has to hold for the
        // empty-pattern corner.
        assert!(!match_wildcard("anything", ""));
        assert!(match_wildcard("", ""));
    }
}
