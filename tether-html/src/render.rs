//! Plain HTML rendering of a node tree.

use std::fmt;

use crate::node::{Child, Node};
use crate::value::scalar_to_string;

/// Attribute the client uses to map rendered elements back to node ids.
pub const NODE_ID_ATTRIBUTE: &str = "data-tether-node-id";

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn push_attr(out: &mut String, name: &str, value: &str) {
    out.push(' ');
    out.push_str(name);
    out.push_str("=\"");
    out.push_str(&escape_html(value));
    out.push('"');
}

impl Node {
    /// Render this subtree as HTML. Does not touch pending patches.
    pub fn to_html(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out);
        out
    }

    fn render_into(&self, out: &mut String) {
        out.push('<');
        out.push_str(self.tag());
        push_attr(out, NODE_ID_ATTRIBUTE, &self.id().to_string());

        let ids = self.id_list(|ids| ids.to_attribute_string());
        if !ids.is_empty() {
            push_attr(out, "id", &ids);
        }
        let classes = self.class_list(|classes| classes.to_attribute_string());
        if !classes.is_empty() {
            push_attr(out, "class", &classes);
        }
        let style = self.style(|style| style.to_attribute_string());
        if !style.is_empty() {
            push_attr(out, "style", &style);
        }
        let attributes: Vec<(String, String)> = self.attributes(|attrs| {
            attrs
                .iter()
                .map(|(name, value)| (name.to_string(), scalar_to_string(value)))
                .collect()
        });
        for (name, value) in &attributes {
            push_attr(out, name, value);
        }
        if let Some(widget) = self.widget_name() {
            push_attr(out, "data-tether-widget", widget);
        }

        if self.is_self_closing() {
            out.push_str(" />");
            return;
        }
        out.push('>');
        for child in self.children() {
            match child {
                Child::Node(node) => node.render_into(out),
                Child::Text(text) => out.push_str(&escape_html(text.text())),
            }
        }
        out.push_str("</");
        out.push_str(self.tag());
        out.push('>');
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_html())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::{br, div};

    #[test]
    fn test_render_escapes() {
        let node = div().with_text("<b>&</b>");
        node.set_attribute("title", "a\"b").unwrap();
        node.add_class("x").unwrap();
        let html = node.to_html();
        assert!(html.contains("class=\"x\""));
        assert!(html.contains("title=\"a&quot;b\""));
        assert!(html.contains("&lt;b&gt;&amp;&lt;/b&gt;"));
        assert!(html.ends_with("</div>"));
    }

    #[test]
    fn test_render_self_closing() {
        let node = br();
        let expected = format!("<br {}=\"{}\" />", NODE_ID_ATTRIBUTE, node.id());
        assert_eq!(node.to_string(), expected);
    }

    #[test]
    fn test_render_keeps_patches() {
        let node = div();
        node.add_class("a").unwrap();
        let _ = node.to_html();
        assert!(node.has_patches());
    }
}
