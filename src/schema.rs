use std::{fs, path::Path};

use anyhow::{Error, bail};
use once_cell::sync::Lazy;
use schemars::schema_for;
use serde_json::Value;

use crate::{flow::FlowDef, message::Step};

static FLOW_SCHEMA: Lazy<Value> = Lazy::new(|| {
    serde_json::to_value(schema_for!(FlowDef)).unwrap_or(Value::Bool(true))
});

/// JSON Schema of flow documents.
pub fn flow_schema() -> &'static Value {
    &FLOW_SCHEMA
}

/// Checks a parsed flow document against [`flow_schema`], reporting every
/// violation with its location.
pub fn validate_flow_value(doc: &Value) -> Result<(), Error> {
    let validator = jsonschema::validator_for(flow_schema())
        .map_err(|e| anyhow::anyhow!("flow schema does not compile: {e}"))?;
    let problems: Vec<String> = validator
        .iter_errors(doc)
        .map(|e| format!("{} at `{}`", e, e.instance_path))
        .collect();
    if !problems.is_empty() {
        bail!("flow does not match schema:\n  {}", problems.join("\n  "));
    }
    Ok(())
}

/// The entry point invoked by `main.rs` for `Commands::Schema`.
pub fn write_schema(out_dir: &Path) -> Result<(), Error> {
    fs::create_dir_all(out_dir)?;
    fs::write(
        out_dir.join("flow.schema.json"),
        serde_json::to_string_pretty(flow_schema())?,
    )?;
    fs::write(
        out_dir.join("step.schema.json"),
        serde_json::to_string_pretty(&schema_for!(Step))?,
    )?;
    Ok(())
}
