//! A small CSS selector subset for finding nodes.
//!
//! Supported: type, `#id`, `.class`, `[attr]`, `[attr=value]` (value may be
//! quoted), compound selectors, the descendant combinator and `,` groups.

use crate::error::{HtmlError, HtmlResult};
use crate::node::Node;
use crate::value::scalar_to_string;

#[derive(Debug, Clone, Default, PartialEq)]
struct Compound {
    tag: Option<String>,
    ids: Vec<String>,
    classes: Vec<String>,
    attributes: Vec<(String, Option<String>)>,
}

impl Compound {
    fn is_empty(&self) -> bool {
        self.tag.is_none() && self.ids.is_empty() && self.classes.is_empty() && self.attributes.is_empty()
    }

    fn matches(&self, node: &Node) -> bool {
        if let Some(tag) = &self.tag {
            if tag != "*" && !tag.eq_ignore_ascii_case(node.tag()) {
                return false;
            }
        }
        if !self.ids.iter().all(|id| node.has_id(id)) {
            return false;
        }
        if !self.classes.iter().all(|class| node.has_class(class)) {
            return false;
        }
        self.attributes.iter().all(|(name, expected)| {
            match (node.get_attribute(name), expected) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(value), Some(expected)) => scalar_to_string(&value) == *expected,
            }
        })
    }
}

/// A parsed selector group.
#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    // each alternative is a descendant chain, outermost first
    alternatives: Vec<Vec<Compound>>,
}

fn invalid(selector: &str, reason: &str) -> HtmlError {
    HtmlError::InvalidSelector {
        selector: selector.to_string(),
        reason: reason.to_string(),
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_'
}

/// Index of the `]` closing the bracket at `open`, skipping quoted text.
fn closing_bracket(chars: &[char], open: usize) -> Option<usize> {
    let mut quote = None;
    for (i, c) in chars.iter().enumerate().skip(open + 1) {
        match (quote, *c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(*c),
            (None, ']') => return Some(i),
            (None, _) => {}
        }
    }
    None
}

/// Split into `,` groups of whitespace-separated compounds. Separators
/// inside `[...]`, quoted values included, belong to the compound.
fn tokenize(source: &str) -> Vec<Vec<String>> {
    let chars: Vec<char> = source.chars().collect();
    let mut groups = Vec::new();
    let mut parts = Vec::new();
    let mut part = String::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '[' => {
                let end = closing_bracket(&chars, i).unwrap_or(chars.len() - 1);
                part.extend(&chars[i..=end]);
                i = end + 1;
                continue;
            }
            ',' => {
                if !part.is_empty() {
                    parts.push(std::mem::take(&mut part));
                }
                groups.push(std::mem::take(&mut parts));
            }
            c if c.is_whitespace() => {
                if !part.is_empty() {
                    parts.push(std::mem::take(&mut part));
                }
            }
            c => part.push(c),
        }
        i += 1;
    }
    if !part.is_empty() {
        parts.push(part);
    }
    groups.push(parts);
    groups
}

fn parse_compound(source: &str, part: &str) -> HtmlResult<Compound> {
    let mut compound = Compound::default();
    let chars: Vec<char> = part.chars().collect();
    let mut i = 0;

    let read_ident = |i: &mut usize| -> String {
        let start = *i;
        while *i < chars.len() && is_ident_char(chars[*i]) {
            *i += 1;
        }
        chars[start..*i].iter().collect()
    };

    if i < chars.len() && chars[i] == '*' {
        compound.tag = Some("*".to_string());
        i += 1;
    } else if i < chars.len() && is_ident_char(chars[i]) {
        compound.tag = Some(read_ident(&mut i));
    }

    while i < chars.len() {
        match chars[i] {
            '#' | '.' => {
                let marker = chars[i];
                i += 1;
                let name = read_ident(&mut i);
                if name.is_empty() {
                    return Err(invalid(source, "expected a name after '#' or '.'"));
                }
                if marker == '#' {
                    compound.ids.push(name);
                } else {
                    compound.classes.push(name);
                }
            }
            '[' => {
                let close = closing_bracket(&chars, i).ok_or_else(|| invalid(source, "unclosed '['"))?;
                let inner: String = chars[i + 1..close].iter().collect();
                let (name, value) = match inner.split_once('=') {
                    Some((name, value)) => {
                        let value = value.trim();
                        let value = value
                            .strip_prefix('"')
                            .and_then(|v| v.strip_suffix('"'))
                            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                            .unwrap_or(value);
                        (name.trim().to_string(), Some(value.to_string()))
                    }
                    None => (inner.trim().to_string(), None),
                };
                if name.is_empty() || !name.chars().all(is_ident_char) {
                    return Err(invalid(source, "bad attribute name"));
                }
                compound.attributes.push((name, value));
                i = close + 1;
            }
            other => {
                return Err(invalid(source, &format!("unexpected character '{}'", other)));
            }
        }
    }

    if compound.is_empty() {
        return Err(invalid(source, "empty compound selector"));
    }
    Ok(compound)
}

impl Selector {
    pub fn parse(source: &str) -> HtmlResult<Self> {
        let mut alternatives = Vec::new();
        for group in tokenize(source) {
            let chain: Vec<Compound> = group
                .iter()
                .map(|part| parse_compound(source, part))
                .collect::<HtmlResult<_>>()?;
            if chain.is_empty() {
                return Err(invalid(source, "empty selector"));
            }
            alternatives.push(chain);
        }
        Ok(Self { alternatives })
    }

    pub fn matches(&self, node: &Node) -> bool {
        self.alternatives.iter().any(|chain| chain_matches(chain, node))
    }
}

fn chain_matches(chain: &[Compound], node: &Node) -> bool {
    let Some((last, rest)) = chain.split_last() else {
        return false;
    };
    if !last.matches(node) {
        return false;
    }
    // greedy match of the remaining compounds against the ancestor chain
    let mut remaining = rest.iter().rev().peekable();
    for ancestor in node.ancestors() {
        match remaining.peek() {
            Some(compound) if compound.matches(&ancestor) => {
                remaining.next();
            }
            Some(_) => {}
            None => break,
        }
    }
    remaining.peek().is_none()
}

impl Node {
    /// First descendant (excluding this node) matching `selector`.
    pub fn query_selector(&self, selector: &str) -> HtmlResult<Option<Node>> {
        let selector = Selector::parse(selector)?;
        Ok(self
            .iter_nodes()
            .into_iter()
            .skip(1)
            .find(|node| selector.matches(node)))
    }

    pub fn query_selector_all(&self, selector: &str) -> HtmlResult<Vec<Node>> {
        let selector = Selector::parse(selector)?;
        Ok(self
            .iter_nodes()
            .into_iter()
            .skip(1)
            .filter(|node| selector.matches(node))
            .collect())
    }

    /// This node or the nearest ancestor matching `selector`.
    pub fn closest(&self, selector: &str) -> HtmlResult<Option<Node>> {
        let selector = Selector::parse(selector)?;
        if selector.matches(self) {
            return Ok(Some(self.clone()));
        }
        Ok(self.ancestors().into_iter().find(|node| selector.matches(node)))
    }

    pub fn matches(&self, selector: &str) -> HtmlResult<bool> {
        Ok(Selector::parse(selector)?.matches(self))
    }
}
