//! Glob matching over disk paths.
//!
//! Supported syntax: `*` and `?` within a segment, `[abc]` / `[a-z]` /
//! `[!abc]` character classes, `**` across segments, and `{a,b}`
//! alternation (nestable). Patterns are always anchored at the root.

use crate::path::AbsPath;

// ── Alternation ─────────────────────────────────────────────────────────────

/// Byte offset of the `}` closing the `{` at `open`, if balanced.
fn closing_brace(pattern: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, ch) in pattern[open..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Top-level comma-separated alternatives of a brace body.
fn alternatives(body: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, ch) in body.char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                out.push(&body[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&body[start..]);
    out
}

/// Expand `{a,b}` alternation into plain patterns. An unbalanced `{` is
/// taken literally.
pub fn expand_braces(pattern: &str) -> Vec<String> {
    let Some(open) = pattern.find('{') else {
        return vec![pattern.to_string()];
    };
    let Some(close) = closing_brace(pattern, open) else {
        return vec![pattern.to_string()];
    };
    let (head, tail) = (&pattern[..open], &pattern[close + 1..]);
    alternatives(&pattern[open + 1..close])
        .into_iter()
        .flat_map(|alt| expand_braces(&format!("{}{}{}", head, alt.trim(), tail)))
        .collect()
}

// ── Single segment ──────────────────────────────────────────────────────────

/// Try to match a `[...]` class at the start of `pat` against `ch`.
/// Returns the match result and the rest of the pattern, or `None` when the
/// class is unterminated (the `[` is then literal).
fn match_class(pat: &[char], ch: char) -> Option<(bool, &[char])> {
    let mut i = 1;
    let negated = matches!(pat.get(i), Some('!') | Some('^'));
    if negated {
        i += 1;
    }
    let mut matched = false;
    let mut first = true;
    while i < pat.len() {
        let c = pat[i];
        if c == ']' && !first {
            return Some((matched != negated, &pat[i + 1..]));
        }
        if pat.get(i + 1) == Some(&'-') && pat.get(i + 2).is_some_and(|e| *e != ']') {
            if (c..=pat[i + 2]).contains(&ch) {
                matched = true;
            }
            i += 3;
        } else {
            if c == ch {
                matched = true;
            }
            i += 1;
        }
        first = false;
    }
    None
}

fn match_chars(name: &[char], pat: &[char]) -> bool {
    match pat.split_first() {
        None => name.is_empty(),
        Some(('*', rest)) => (0..=name.len()).any(|skip| match_chars(&name[skip..], rest)),
        Some(('?', rest)) => !name.is_empty() && match_chars(&name[1..], rest),
        Some(('[', _)) => {
            let Some((&ch, name_rest)) = name.split_first() else {
                return false;
            };
            match match_class(pat, ch) {
                Some((true, rest)) => match_chars(name_rest, rest),
                Some((false, _)) => false,
                None => ch == '[' && match_chars(name_rest, &pat[1..]),
            }
        }
        Some((lit, rest)) => name.first() == Some(lit) && match_chars(&name[1..], rest),
    }
}

/// Match one path segment against a segment pattern (no `/`).
pub fn match_segment(segment: &str, pattern: &str) -> bool {
    let name: Vec<char> = segment.chars().collect();
    let pat: Vec<char> = pattern.chars().collect();
    match_chars(&name, &pat)
}

// ── Whole path ──────────────────────────────────────────────────────────────

fn match_segments(path: &[&str], pat: &[&str]) -> bool {
    match pat.split_first() {
        None => path.is_empty(),
        Some((&"**", rest)) => (0..=path.len()).any(|skip| match_segments(&path[skip..], rest)),
        Some((seg_pat, rest)) => match path.split_first() {
            Some((seg, path_rest)) => match_segment(seg, seg_pat) && match_segments(path_rest, rest),
            None => false,
        },
    }
}

/// Match an absolute path against a glob pattern. Relative patterns are
/// anchored at the root, so `**/*.md` and `/**/*.md` are equivalent.
pub fn match_glob(file_path: &AbsPath, pattern: &str) -> bool {
    let segments: Vec<&str> = file_path.segments().collect();
    expand_braces(pattern).iter().any(|expanded| {
        let parts: Vec<&str> = expanded
            .split(['/', '\\'])
            .filter(|s| !s.is_empty() && *s != ".")
            .collect();
        match_segments(&segments, &parts)
    })
}

// ── Pattern lists ───────────────────────────────────────────────────────────

/// Split a pattern list into positive and `!`-negated patterns.
pub fn partition_patterns(patterns: &[String]) -> (Vec<&str>, Vec<&str>) {
    let (negated, positive): (Vec<&str>, Vec<&str>) = patterns
        .iter()
        .map(String::as_str)
        .partition(|p| p.starts_with('!'));
    (positive, negated.into_iter().map(|p| &p[1..]).collect())
}

/// True when `path` matches any positive pattern (or there are none) and no
/// negative pattern.
pub fn matches_any(path: &AbsPath, positive: &[&str], negative: &[&str]) -> bool {
    let included = positive.is_empty() || positive.iter().any(|p| match_glob(path, p));
    included && !negative.iter().any(|p| match_glob(path, p))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> AbsPath {
        crate::path::normalize(s).unwrap()
    }

    #[test]
    fn braces_expand_in_order() {
        assert_eq!(expand_braces("/notes/{a,b}.md"), vec!["/notes/a.md", "/notes/b.md"]);
        assert_eq!(expand_braces("pre-{a,b}-suf"), vec!["pre-a-suf", "pre-b-suf"]);
        assert_eq!(expand_braces("{a,{b,c}}"), vec!["a", "b", "c"]);
        assert_eq!(expand_braces("plain"), vec!["plain"]);
        assert_eq!(expand_braces("foo{bar"), vec!["foo{bar"]);
    }

    #[test]
    fn segment_wildcards() {
        assert!(match_segment("hello.txt", "*.txt"));
        assert!(match_segment("test.spec.ts", "*.spec.*"));
        assert!(match_segment("ab", "?b"));
        assert!(!match_segment("ab", "?"));
        assert!(match_segment("", "*"));
        assert!(!match_segment("a", ""));
    }

    #[test]
    fn segment_classes() {
        assert!(match_segment("a1.md", "a[0-9].md"));
        assert!(!match_segment("ax.md", "a[0-9].md"));
        assert!(match_segment("ax.md", "a[!0-9].md"));
        assert!(match_segment("b", "[abc]"));
        // Unterminated class is literal.
        assert!(match_segment("[x", "[x"));
    }

    #[test]
    fn globstar_spans_segments() {
        assert!(match_glob(&p("/a/b/c/d.md"), "/**/*.md"));
        assert!(match_glob(&p("/d.md"), "**/*.md"));
        assert!(match_glob(&p("/a/b/c"), "/a/**"));
        assert!(match_glob(&p("/a"), "/a/**"));
        assert!(!match_glob(&p("/b/c"), "/a/**"));
    }

    #[test]
    fn braces_in_paths() {
        assert!(match_glob(&p("/img/cat.png"), "/img/*.{png,jpg}"));
        assert!(!match_glob(&p("/img/cat.gif"), "/img/*.{png,jpg}"));
    }

    #[test]
    fn negated_patterns_exclude() {
        let patterns = vec!["**/*.md".to_string(), "!/drafts/**".to_string()];
        let (pos, neg) = partition_patterns(&patterns);
        assert_eq!(neg, vec!["/drafts/**"]);
        assert!(matches_any(&p("/notes/a.md"), &pos, &neg));
        assert!(!matches_any(&p("/drafts/a.md"), &pos, &neg));
        assert!(matches_any(&p("/anything"), &[], &[]));
    }
}
