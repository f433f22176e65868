//! Value validation for attribute stores and widget data.

use serde_json::Value;

use crate::error::{HtmlError, HtmlResult};

/// Maximum nesting depth accepted in widget data.
pub const MAX_WIDGET_DATA_DEPTH: usize = 64;

/// True for bool, number and string values.
pub fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::Bool(_) | Value::Number(_) | Value::String(_))
}

/// Validate an attribute value; only scalars may be stored on a node.
pub fn check_attribute_value(name: &str, value: &Value) -> HtmlResult<()> {
    if is_scalar(value) {
        Ok(())
    } else {
        Err(HtmlError::InvalidAttributeValue {
            name: name.to_string(),
        })
    }
}

/// Validate widget data: scalars, null and nested arrays/objects of those.
pub fn check_widget_data(value: &Value) -> HtmlResult<()> {
    check_widget_data_at(value, 0)
}

fn check_widget_data_at(value: &Value, depth: usize) -> HtmlResult<()> {
    if depth > MAX_WIDGET_DATA_DEPTH {
        return Err(HtmlError::InvalidWidgetData {
            reason: format!("nesting deeper than {}", MAX_WIDGET_DATA_DEPTH),
        });
    }
    match value {
        Value::Array(items) => items
            .iter()
            .try_for_each(|item| check_widget_data_at(item, depth + 1)),
        Value::Object(map) => map
            .values()
            .try_for_each(|item| check_widget_data_at(item, depth + 1)),
        _ => Ok(()),
    }
}

/// Validate an id or class token.
pub fn check_token(token: &str) -> HtmlResult<()> {
    if token.is_empty() || token.chars().any(char::is_whitespace) {
        return Err(HtmlError::InvalidToken {
            token: token.to_string(),
        });
    }
    Ok(())
}

/// Render a scalar the way it appears inside an HTML attribute.
pub fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalars_accepted() {
        for v in [json!(true), json!(1), json!(1.5), json!("x")] {
            assert!(check_attribute_value("a", &v).is_ok());
        }
    }

    #[test]
    fn test_containers_rejected_as_attributes() {
        assert!(matches!(
            check_attribute_value("a", &json!([1])),
            Err(HtmlError::InvalidAttributeValue { .. })
        ));
        assert!(check_attribute_value("a", &json!({"k": 1})).is_err());
        assert!(check_attribute_value("a", &Value::Null).is_err());
    }

    #[test]
    fn test_widget_data_nested() {
        assert!(check_widget_data(&json!({"a": [1, {"b": null}], "c": "d"})).is_ok());
    }

    #[test]
    fn test_tokens() {
        assert!(check_token("foo").is_ok());
        assert!(check_token("").is_err());
        assert!(check_token("a b").is_err());
    }
}
