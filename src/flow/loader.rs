//! Reading flow and entity documents from disk.
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use serde_yaml_bw::Value as YamlValue;
use tracing::{info, warn};

use crate::{
    entity::{EntityRef, EntityType, InMemoryEntityStore},
    flow::{Flow, FlowDef, FlowStore},
    schema::validate_flow_value,
    util::{DocFormat, doc_format},
};

/// Reads a YAML or JSON document into a JSON value.
pub fn read_document(path: &Path) -> Result<JsonValue> {
    if !path.exists() {
        bail!("File does not exist: {}", path.display());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read file: {}", path.display()))?;

    match doc_format(path) {
        Some(DocFormat::Json) => serde_json::from_str(&content)
            .with_context(|| format!("Invalid JSON in file: {}", path.display())),
        Some(DocFormat::Yaml) => {
            let yaml: YamlValue = serde_yaml_bw::from_str(&content)
                .with_context(|| format!("Invalid YAML in file: {}", path.display()))?;
            Ok(serde_json::to_value(yaml)?)
        }
        None => bail!("Unsupported file extension for: {}", path.display()),
    }
}

/// Validate that the provided file is a well-formed flow definition.
pub fn validate_flow_file(path: &Path) -> Result<FlowDef> {
    let doc = read_document(path)?;
    validate_flow_value(&doc).with_context(|| format!("Invalid flow: {}", path.display()))?;

    let def: FlowDef = serde_json::from_value(doc)
        .with_context(|| format!("Invalid flow: {}", path.display()))?;
    def.validate()
        .with_context(|| format!("Invalid flow: {}", path.display()))?;

    info!("✅ Valid flow `{}`: {}", def.name, path.display());
    Ok(def)
}

pub fn publish_flow_file(store: &FlowStore, path: &Path) -> Result<Arc<Flow>> {
    let def = validate_flow_file(path)?;
    let flow = store
        .publish(&def)
        .with_context(|| format!("Failed to publish {}", path.display()))?;
    Ok(flow)
}

/// Flow documents in `dir`, in file name order.
pub fn flow_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_file() && doc_format(&path).is_some() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Publishes every flow document in `dir`. Stops at the first invalid file;
/// flows published before it stay published.
pub fn publish_dir(store: &FlowStore, dir: &Path) -> Result<Vec<Arc<Flow>>> {
    let files = flow_files(dir)?;
    if files.is_empty() {
        warn!("no flow files in {}", dir.display());
    }
    files
        .iter()
        .map(|path| publish_flow_file(store, path))
        .collect()
}

#[derive(Debug, Deserialize)]
struct EntityDoc {
    kind: String,
    id: String,
    #[serde(flatten)]
    data: serde_json::Map<String, JsonValue>,
}

/// Loads a list of `{kind, id, ...fields}` records into `store`.
pub fn load_entities_file(store: &InMemoryEntityStore, path: &Path) -> Result<usize> {
    let doc = read_document(path)?;
    let records: Vec<EntityDoc> = serde_json::from_value(doc)
        .with_context(|| format!("Invalid entity list: {}", path.display()))?;

    let count = records.len();
    for record in records {
        let kind = EntityType::from_str(&record.kind)
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("Entity {} in {}", record.id, path.display()))?;
        store.insert(EntityRef::new(kind, record.id), JsonValue::Object(record.data));
    }
    info!("📦 loaded {count} entities from {}", path.display());
    Ok(count)
}
