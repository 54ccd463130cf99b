//! Branch pattern matching for [`super::can_push_to_branch`] (§4.1).
//!
//! `*` matches everything; a pattern with no `*` is an exact match;
//! otherwise the pattern is anchored end-to-end as a regex, with `*`
//! translated to `.*` and every other regex metacharacter in the literal
//! segments escaped.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Mutex;

static CACHE: Lazy<Mutex<HashMap<String, Regex>>> = Lazy::new(|| Mutex::new(HashMap::new()));

pub fn matches_branch_pattern(branch: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return branch == pattern;
    }

    let mut cache = CACHE.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let regex = cache.entry(pattern.to_string()).or_insert_with(|| {
        let mut anchored = String::from("^");
        for part in pattern.split('*') {
            anchored.push_str(&regex::escape(part));
            anchored.push_str(".*");
        }
        // split('*') leaves one trailing ".*" too many; trim it back off.
        anchored.truncate(anchored.len() - 2);
        anchored.push('$');
        Regex::new(&anchored).unwrap_or_else(|_| Regex::new("^$").expect("trivial regex"))
    });
    regex.is_match(branch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_everything() {
        assert!(matches_branch_pattern("anything/goes", "*"));
    }

    #[test]
    fn exact_match_without_star() {
        assert!(matches_branch_pattern("main", "main"));
        assert!(!matches_branch_pattern("main2", "main"));
    }

    #[test]
    fn glob_star_translates_to_regex() {
        assert!(matches_branch_pattern("release/1.0", "release/*"));
        assert!(!matches_branch_pattern("releases/1.0", "release/*"));
        assert!(matches_branch_pattern("feature/foo/bar", "feature/*"));
    }

    #[test]
    fn metacharacters_in_literal_segments_are_escaped() {
        assert!(matches_branch_pattern("v1.0", "v1.0"));
        assert!(!matches_branch_pattern("v1x0", "v1.0"));
    }

    /// P3: the decision only depends on the first matching rule, regardless
    /// of how many later rules would also match.
    #[test]
    fn first_match_wins_property() {
        let rules = [("release/*", "a"), ("*", "b")];
        let branch = "release/2.0";
        let decided = rules
            .iter()
            .find(|(pattern, _)| matches_branch_pattern(branch, pattern))
            .map(|(_, v)| *v);
        assert_eq!(decided, Some("a"));
    }
}
