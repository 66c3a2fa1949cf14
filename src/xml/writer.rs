//! Tree-to-XML serialization, the inverse of the parser's shape: string
//! entries become attributes, object/array entries become child elements,
//! `"#text"` becomes element text. Attributes come out in key order, so
//! output is deterministic for a given tree.

use serde_json::Value;

use super::XmlError;

pub const XML_DECLARATION: &str = "<?xml version=\"1.0\" encoding=\"utf-8\"?>";

/// Serialize a `{ "<RootTag>": <element> }` document with the ingestion
/// declaration convention and two-space indentation.
pub fn write_document(doc: &Value) -> Result<String, XmlError> {
    let Some(map) = doc.as_object() else {
        return Err(XmlError::Unwritable(type_name(doc).into()));
    };
    let Some((tag, element)) = map.iter().next() else {
        return Err(XmlError::NoRoot);
    };

    let mut out = String::from(XML_DECLARATION);
    out.push('\n');
    write_element(&mut out, tag, element, 0)?;
    Ok(out)
}

fn write_element(out: &mut String, tag: &str, element: &Value, depth: usize) -> Result<(), XmlError> {
    // A one-element array is the unfolded form of the same node.
    if let Value::Array(items) = element {
        for item in items {
            write_element(out, tag, item, depth)?;
        }
        return Ok(());
    }
    let Some(map) = element.as_object() else {
        return Err(XmlError::Unwritable(type_name(element).into()));
    };

    indent(out, depth);
    out.push('<');
    out.push_str(tag);

    let mut text: Option<&str> = None;
    let mut children: Vec<(&String, &Value)> = Vec::new();
    for (key, value) in map {
        match value {
            Value::String(s) if key == "#text" => text = Some(s),
            Value::String(s) => {
                out.push(' ');
                out.push_str(key);
                out.push_str("=\"");
                out.push_str(&escape(s, true));
                out.push('"');
            }
            Value::Object(_) | Value::Array(_) => children.push((key, value)),
            other => return Err(XmlError::Unwritable(type_name(other).into())),
        }
    }

    if text.is_none() && children.is_empty() {
        out.push_str("/>\n");
        return Ok(());
    }
    out.push('>');

    if let Some(text) = text {
        out.push_str(&escape(text, false));
    }
    if !children.is_empty() {
        out.push('\n');
        for (key, value) in children {
            write_element(out, key, value, depth + 1)?;
        }
        indent(out, depth);
    }
    out.push_str("</");
    out.push_str(tag);
    out.push_str(">\n");
    Ok(())
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str("  ");
    }
}

fn escape(raw: &str, in_attribute: bool) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if in_attribute => out.push_str("&quot;"),
            other => out.push(other),
        }
    }
    out
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::parse_document;
    use serde_json::json;

    #[test]
    fn writes_declaration_attributes_and_children() {
        let doc = json!({
            "Order": {
                "Case": {
                    "Accession": "A1",
                    "Subscriber": [
                        { "PolicyNum": "P1", "Responsibility": "Primary" },
                        { "PolicyNum": "P2", "Responsibility": "Secondary" }
                    ]
                }
            }
        });
        let xml = write_document(&doc).unwrap();
        assert!(xml.starts_with(XML_DECLARATION));
        assert!(xml.contains("<Case Accession=\"A1\">"));
        assert!(xml.contains("<Subscriber PolicyNum=\"P1\" Responsibility=\"Primary\"/>"));
        assert!(xml.contains("</Case>"));
    }

    #[test]
    fn empty_element_self_closes() {
        let xml = write_document(&json!({ "Order": {} })).unwrap();
        assert!(xml.contains("<Order/>"));
    }

    #[test]
    fn text_and_special_characters_are_escaped() {
        let doc = json!({ "Note": { "Label": "a & \"b\"", "#text": "x < y" } });
        let xml = write_document(&doc).unwrap();
        assert!(xml.contains("Label=\"a &amp; &quot;b&quot;\""));
        assert!(xml.contains(">x &lt; y</Note>"));
    }

    #[test]
    fn parse_then_write_preserves_structure() {
        let input = r#"<Order><Case Accession="A9"><Subscriber PolicyNum="P1"/></Case></Order>"#;
        let doc = parse_document(input, &["Order.Case".to_string()]).unwrap();
        let xml = write_document(&doc).unwrap();
        let reparsed = parse_document(&xml, &["Order.Case".to_string()]).unwrap();
        assert_eq!(doc, reparsed);
    }

    #[test]
    fn scalar_nodes_are_unwritable() {
        let err = write_document(&json!({ "Order": { "Count": 3 } })).unwrap_err();
        assert!(matches!(err, XmlError::Unwritable(_)));
        assert!(matches!(
            write_document(&json!("plain")).unwrap_err(),
            XmlError::Unwritable(_)
        ));
    }
}
