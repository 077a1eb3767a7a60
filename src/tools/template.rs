//! Confirmation summary templates
//!
//! Templates use `{name}` placeholders that refer to top-level invocation
//! arguments, e.g. `Send {amount} {token} to @{recipient}`. `{{` and `}}`
//! produce literal braces.

use crate::error::AgentError;
use crate::Result;
use serde_json::Value;

enum Segment<'a> {
    Literal(&'a str),
    Brace(char),
    Placeholder(&'a str),
}

fn parse(template: &str) -> Result<Vec<Segment<'_>>> {
    let mut segments = Vec::new();
    let mut rest = template;

    while !rest.is_empty() {
        let Some(pos) = rest.find(|c| c == '{' || c == '}') else {
            segments.push(Segment::Literal(rest));
            break;
        };

        if pos > 0 {
            segments.push(Segment::Literal(&rest[..pos]));
        }
        rest = &rest[pos..];

        if rest.starts_with("{{") {
            segments.push(Segment::Brace('{'));
            rest = &rest[2..];
        } else if rest.starts_with("}}") {
            segments.push(Segment::Brace('}'));
            rest = &rest[2..];
        } else if rest.starts_with('{') {
            let end = rest.find('}').ok_or_else(|| {
                AgentError::TemplateError(format!("unclosed placeholder in '{}'", template))
            })?;
            let name = rest[1..end].trim();
            if name.is_empty() {
                return Err(AgentError::TemplateError(format!(
                    "empty placeholder in '{}'",
                    template
                )));
            }
            segments.push(Segment::Placeholder(name));
            rest = &rest[end + 1..];
        } else {
            return Err(AgentError::TemplateError(format!(
                "unmatched '}}' in '{}'",
                template
            )));
        }
    }

    Ok(segments)
}

/// Placeholder names referenced by a template, in order of appearance.
pub fn placeholders(template: &str) -> Result<Vec<String>> {
    let mut names: Vec<String> = Vec::new();
    for segment in parse(template)? {
        if let Segment::Placeholder(name) = segment {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

/// Render a template against an argument object.
///
/// A placeholder with no matching argument (or a null one) is an error.
pub fn render(template: &str, arguments: &Value) -> Result<String> {
    let mut out = String::with_capacity(template.len());

    for segment in parse(template)? {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Brace(c) => out.push(c),
            Segment::Placeholder(name) => match arguments.get(name) {
                None | Some(Value::Null) => {
                    return Err(AgentError::TemplateError(format!(
                        "missing argument '{}'",
                        name
                    )))
                }
                Some(Value::String(s)) => out.push_str(s),
                Some(other) => out.push_str(&other.to_string()),
            },
        }
    }

    Ok(out)
}

/// Placeholders of `template` that are not properties of `input_schema`.
pub fn undocumented_placeholders(template: &str, input_schema: &Value) -> Result<Vec<String>> {
    let properties = input_schema.get("properties").and_then(Value::as_object);

    Ok(placeholders(template)?
        .into_iter()
        .filter(|name| properties.map_or(true, |props| !props.contains_key(name)))
        .collect())
}
