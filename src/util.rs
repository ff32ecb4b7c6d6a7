use std::path::Path;

use handlebars::Handlebars;
use once_cell::sync::Lazy;
use serde_json::{Map, Value};
use tracing::error;

use crate::context::{Attrs, ContextValue};

static REGISTRY: Lazy<Handlebars<'static>> = Lazy::new(|| {
    let mut hb = Handlebars::new();
    hb.register_escape_fn(handlebars::no_escape);
    hb
});

/// Renders `template` against `data`. Broken templates render verbatim.
pub fn render_handlebars(template: &str, data: &Value) -> String {
    match REGISTRY.render_template(template, data) {
        Ok(rendered) => rendered,
        Err(e) => {
            error!("template error in {:?}: {}", template, e);
            template.to_string()
        }
    }
}

/// Flattens a flow context for templating. References render as `Kind:id`.
pub fn attrs_to_json(attrs: &Attrs) -> Value {
    let map: Map<String, Value> = attrs
        .iter()
        .map(|(k, v)| {
            let value = match v {
                ContextValue::Literal(v) => v.clone(),
                ContextValue::Reference(r) => Value::String(r.to_string()),
            };
            (k.clone(), value)
        })
        .collect();
    Value::Object(map)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocFormat {
    Json,
    Yaml,
}

/// Document format by file extension.
pub fn doc_format(path: &Path) -> Option<DocFormat> {
    let ext = path
        .extension()
        .and_then(|os| os.to_str())
        .unwrap_or_default()
        .to_lowercase();
    match ext.as_str() {
        "json" => Some(DocFormat::Json),
        "yaml" | "yml" => Some(DocFormat::Yaml),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityType;
    use serde_json::json;

    #[test]
    fn renders_context_values() {
        let mut attrs = Attrs::new();
        attrs.insert("name".into(), ContextValue::literal("Ada"));
        attrs.insert("lesson".into(), ContextValue::reference(EntityType::Lesson, "l1"));
        let data = attrs_to_json(&attrs);
        assert_eq!(data, json!({"name": "Ada", "lesson": "Lesson:l1"}));
        assert_eq!(
            render_handlebars("Hi {{name}}, on to {{lesson}} & more", &data),
            "Hi Ada, on to Lesson:l1 & more"
        );
    }

    #[test]
    fn broken_template_is_returned_as_is() {
        assert_eq!(render_handlebars("{{#if}}", &json!({})), "{{#if}}");
    }

    #[test]
    fn format_by_extension() {
        assert_eq!(doc_format(Path::new("a/flow.YAML")), Some(DocFormat::Yaml));
        assert_eq!(doc_format(Path::new("flow.json")), Some(DocFormat::Json));
        assert_eq!(doc_format(Path::new("flow.txt")), None);
    }
}
