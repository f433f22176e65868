//! Shorthand constructors for common elements.

use serde_json::Value;

use crate::error::HtmlResult;
use crate::node::Node;

macro_rules! container_tags {
    ($($name:ident),+ $(,)?) => {
        $(
            pub fn $name() -> Node {
                Node::new(stringify!($name))
            }
        )+
    };
}

container_tags!(div, span, p, h1, h2, h3, button, a, ul, ol, li, pre, form, label, table, tr, td);

pub fn input() -> Node {
    Node::self_closing("input")
}

pub fn br() -> Node {
    Node::self_closing("br")
}

pub fn img() -> Node {
    Node::self_closing("img")
}

pub fn text(content: &str) -> Node {
    span().with_text(content)
}

pub fn widget(tag: &str, name: &str, data: Value) -> HtmlResult<Node> {
    Node::widget(tag, name, data)
}
