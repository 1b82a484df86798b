//! Wire types for discovered MCP data.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool advertised by a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

/// A prompt template advertised by a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prompt {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub arguments: Value,
}

/// A concrete resource advertised by a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub uri: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// A parameterized resource URI advertised by a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTemplate {
    pub uri_template: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// A discovered item tagged with its originating server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Namespaced<T> {
    pub server_id: String,
    #[serde(flatten)]
    pub item: T,
}

// List-result envelopes; missing capability lists deserialize as empty.

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ToolsList {
    #[serde(default)]
    pub tools: Vec<Tool>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct PromptsList {
    #[serde(default)]
    pub prompts: Vec<Prompt>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ResourcesList {
    #[serde(default)]
    pub resources: Vec<Resource>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ResourceTemplatesList {
    #[serde(default, rename = "resourceTemplates")]
    pub resource_templates: Vec<ResourceTemplate>,
}
