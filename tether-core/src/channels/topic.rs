//! Symmetric shell-style topic matching.

use regex::Regex;

/// Convert a shell glob to an anchored regex: `*`, `?`, `[seq]`, `[!seq]`.
/// Other regex metacharacters are escaped; an unterminated `[` is literal.
/// Wildcards match any character, newlines included.
fn glob_to_regex(glob: &str) -> String {
    let chars: Vec<char> = glob.chars().collect();
    let mut out = String::with_capacity(glob.len() * 2 + 5);
    out.push_str("(?s)^");
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                // find the closing bracket; a `]` right after `[` or `[!` is literal
                let mut j = i + 1;
                if j < chars.len() && chars[j] == '!' {
                    j += 1;
                }
                if j < chars.len() && chars[j] == ']' {
                    j += 1;
                }
                while j < chars.len() && chars[j] != ']' {
                    j += 1;
                }
                if j >= chars.len() {
                    out.push_str("\\[");
                } else {
                    let mut body: Vec<char> = chars[i + 1..j].to_vec();
                    out.push('[');
                    if body.first() == Some(&'!') {
                        out.push('^');
                        body.remove(0);
                    }
                    for b in body {
                        if matches!(b, '\\' | '[' | ']' | '^') {
                            out.push('\\');
                        }
                        out.push(b);
                    }
                    out.push(']');
                    i = j;
                }
            }
            '.' | '+' | '-' | '^' | '$' | '(' | ')' | ']' | '{' | '}' | '|' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
        i += 1;
    }
    out.push('$');
    out
}

fn has_wildcards(topic: &str) -> bool {
    topic.contains(['*', '?', '['])
}

fn compile(topic: &str) -> Option<Regex> {
    if !has_wildcards(topic) {
        return None;
    }
    Regex::new(&glob_to_regex(topic)).ok()
}

/// A topic with its glob compiled once.
#[derive(Debug, Clone)]
pub struct TopicPattern {
    topic: String,
    glob: Option<Regex>,
}

impl TopicPattern {
    pub fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            glob: compile(topic),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.topic
    }

    /// This topic, read as a glob, matches `topic`.
    pub fn glob_matches(&self, topic: &str) -> bool {
        match &self.glob {
            Some(re) => re.is_match(topic),
            None => self.topic == topic,
        }
    }

    /// Equal, or either side read as a glob matches the other.
    pub fn matches(&self, other: &TopicPattern) -> bool {
        self.topic == other.topic || self.glob_matches(&other.topic) || other.glob_matches(&self.topic)
    }
}

/// `pattern` as a glob matches `topic`.
pub fn glob_matches(pattern: &str, topic: &str) -> bool {
    TopicPattern::new(pattern).glob_matches(topic)
}

/// Two topics match when equal or when either one, read as a glob, matches the other.
pub fn matches(a: &str, b: &str) -> bool {
    a == b || TopicPattern::new(a).matches(&TopicPattern::new(b))
}
