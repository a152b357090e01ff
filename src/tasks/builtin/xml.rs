use std::io::Cursor;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use crate::engine::error::WorkflowError;
use crate::engine::runtime::TaskHandle;
use crate::tasks::TaskHandler;

/// Renders XML files from an element specification and an info map.
///
/// `files_to_create` maps an output path to an element spec:
///
/// ```json
/// {
///   "-name": "mets",
///   "-attr": { "TYPE": "SIP" },
///   "#content": [ { "var": "label" }, { "text": "!" } ],
///   "-children": [ ... ]
/// }
/// ```
///
/// `{ "var": key }` content entries are resolved against the `info` map.
/// The undo entry point removes every file the run created.
pub struct GenerateXml;

pub const GENERATE_XML: &str = "arkflow.tasks.generate_xml";

fn render_element(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    spec: &serde_json::Value,
    info: &serde_json::Value,
) -> Result<()> {
    let name = spec
        .get("-name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("element spec is missing '-name'"))?;

    let mut start = BytesStart::new(name);
    if let Some(attrs) = spec.get("-attr").and_then(|v| v.as_object()) {
        for (key, value) in attrs {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            start.push_attribute((key.as_str(), value.as_str()));
        }
    }
    writer.write_event(Event::Start(start))?;

    if let Some(content) = spec.get("#content").and_then(|v| v.as_array()) {
        let mut text = String::new();
        for entry in content {
            if let Some(var) = entry.get("var").and_then(|v| v.as_str()) {
                match info.get(var) {
                    Some(serde_json::Value::String(s)) => text.push_str(s),
                    Some(other) => text.push_str(&other.to_string()),
                    None => {}
                }
            } else if let Some(literal) = entry.get("text").and_then(|v| v.as_str()) {
                text.push_str(literal);
            }
        }
        if !text.is_empty() {
            writer.write_event(Event::Text(BytesText::new(&text)))?;
        }
    }

    if let Some(children) = spec.get("-children").and_then(|v| v.as_array()) {
        for child in children {
            render_element(writer, child, info)?;
        }
    }

    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

fn files_to_create(params: &serde_json::Value) -> Result<&serde_json::Map<String, serde_json::Value>> {
    params
        .get("files_to_create")
        .and_then(|v| v.as_object())
        .ok_or_else(|| {
            WorkflowError::Parameter {
                task: GENERATE_XML.to_string(),
                message: "missing required object parameter 'files_to_create'".to_string(),
            }
            .into()
        })
}

#[async_trait]
impl TaskHandler for GenerateXml {
    fn name(&self) -> &str {
        GENERATE_XML
    }

    fn params_schema(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({
            "type": "object",
            "required": ["files_to_create"],
            "properties": {
                "files_to_create": { "type": "object" },
                "info": { "type": "object" }
            }
        }))
    }

    async fn run(&self, handle: &TaskHandle) -> Result<serde_json::Value> {
        let params = handle.params();
        let files = files_to_create(params)?;
        let info = params
            .get("info")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));

        let total = files.len() as u64;
        let mut written = Vec::new();
        for (idx, (path, spec)) in files.iter().enumerate() {
            let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
            writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
            render_element(&mut writer, spec, &info)?;

            let buf = writer.into_inner().into_inner();
            tokio::fs::write(path, &buf)
                .await
                .with_context(|| format!("failed to write '{}'", path))?;

            written.push(serde_json::Value::String(path.clone()));
            handle.set_progress(idx as u64 + 1, total).await?;
        }

        Ok(serde_json::Value::Array(written))
    }

    async fn undo(&self, handle: &TaskHandle) -> Result<()> {
        let files = files_to_create(handle.params())?;
        for path in files.keys() {
            tokio::fs::remove_file(path)
                .await
                .with_context(|| format!("failed to remove '{}'", path))?;
        }
        Ok(())
    }

    fn event_outcome_success(&self, params: &serde_json::Value) -> Option<String> {
        let files = params.get("files_to_create")?.as_object()?;
        let names: Vec<&str> = files.keys().map(String::as_str).collect();
        Some(format!("Generated {}", names.join(", ")))
    }
}
