//! Glob patterns over `/`-separated package paths.
//!
//! Grammar: `*` (any run inside one segment), `**` (any number of whole
//! segments, including none), `?` (one character except `/`), `{a,b}`
//! (alternatives, nestable) and `[abc]` / `[!a-z]` character classes.
//! Everything else matches literally.

use regex::Regex;

/// A compiled glob.
#[derive(Debug, Clone)]
pub struct Glob {
    pattern: String,
    regex: Regex,
}

impl Glob {
    /// Compile `pattern`. Unbalanced braces or brackets are matched literally.
    pub fn new(pattern: &str) -> Self {
        let source = format!("^{}$", translate(pattern));
        let regex = Regex::new(&source).unwrap_or_else(|_| {
            // Only reachable for pathological classes; fall back to a literal match.
            Regex::new(&format!("^{}$", regex::escape(pattern))).expect("escaped literal is valid")
        });
        Self {
            pattern: pattern.to_string(),
            regex,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }
}

/// Whether `pattern` uses any glob syntax.
pub fn has_magic(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

fn translate(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    let mut brace_depth = 0usize;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    let at_segment_start = i == 0 || chars[i - 1] == '/';
                    let followed_by_slash = chars.get(i + 2) == Some(&'/');
                    if at_segment_start && followed_by_slash {
                        // `**/` matches zero or more leading directories.
                        out.push_str("(?:[^/]+/)*");
                        i += 3;
                        continue;
                    }
                    out.push_str(".*");
                    i += 2;
                    continue;
                }
                out.push_str("[^/]*");
            }
            '?' => out.push_str("[^/]"),
            '[' => match class_end(&chars, i) {
                Some(end) => {
                    out.push('[');
                    let mut j = i + 1;
                    if chars[j] == '!' || chars[j] == '^' {
                        out.push('^');
                        j += 1;
                    }
                    while j < end {
                        let cc = chars[j];
                        if cc == '\\' || cc == '[' || cc == ']' || cc == '&' || cc == '~' {
                            out.push('\\');
                        }
                        out.push(cc);
                        j += 1;
                    }
                    out.push(']');
                    i = end + 1;
                    continue;
                }
                None => out.push_str("\\["),
            },
            '{' if brace_closes(&chars, i) => {
                brace_depth += 1;
                out.push_str("(?:");
            }
            ',' if brace_depth > 0 => out.push('|'),
            '}' if brace_depth > 0 => {
                brace_depth -= 1;
                out.push(')');
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
        i += 1;
    }
    out
}

/// Index of the `]` closing a class opened at `start`, if any.
fn class_end(chars: &[char], start: usize) -> Option<usize> {
    let mut j = start + 1;
    if matches!(chars.get(j), Some('!') | Some('^')) {
        j += 1;
    }
    // A `]` right after the opening bracket is literal.
    if chars.get(j) == Some(&']') {
        j += 1;
    }
    while j < chars.len() {
        if chars[j] == ']' {
            return (j > start + 1).then_some(j);
        }
        if chars[j] == '/' {
            return None;
        }
        j += 1;
    }
    None
}

fn brace_closes(chars: &[char], start: usize) -> bool {
    let mut depth = 0usize;
    for &c in &chars[start..] {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return true;
                }
            }
            _ => {}
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_star_stays_in_segment() {
        let g = Glob::new("text/*.xhtml");
        assert!(g.is_match("text/ch01.xhtml"));
        assert!(!g.is_match("text/sub/ch01.xhtml"));
        assert!(!g.is_match("ch01.xhtml"));
    }

    #[test]
    fn test_double_star() {
        let g = Glob::new("**/ch01.*");
        assert!(g.is_match("ch01.md"));
        assert!(g.is_match("text/ch01.xhtml"));
        assert!(g.is_match("a/b/c/ch01.xhtml"));
        assert!(!g.is_match("a/xch01.xhtml"));

        let g = Glob::new("text/**");
        assert!(g.is_match("text/a/b.png"));
    }

    #[test]
    fn test_question_and_class() {
        assert!(Glob::new("ch0?.md").is_match("ch07.md"));
        assert!(!Glob::new("ch0?.md").is_match("ch0/.md"));
        assert!(Glob::new("ch[0-2]1.md").is_match("ch11.md"));
        assert!(!Glob::new("ch[!0-2]1.md").is_match("ch11.md"));
    }

    #[test]
    fn test_braces() {
        let g = Glob::new("images/*.{png,jp{e,}g}");
        assert!(g.is_match("images/a.png"));
        assert!(g.is_match("images/a.jpeg"));
        assert!(g.is_match("images/a.jpg"));
        assert!(!g.is_match("images/a.gif"));
    }

    #[test]
    fn test_literal_specials() {
        assert!(Glob::new("a+b (1).css").is_match("a+b (1).css"));
        assert!(Glob::new("{unclosed").is_match("{unclosed"));
        assert!(Glob::new("[x").is_match("[x"));
    }

    #[test]
    fn test_has_magic() {
        assert!(has_magic("*.png"));
        assert!(has_magic("a/{b,c}"));
        assert!(!has_magic("text/ch01.xhtml"));
    }
}
