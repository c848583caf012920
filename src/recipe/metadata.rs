//! Recipe metadata document
//!
//! A bundle declares itself either in `recipe.md` with YAML front matter
//! (the markdown body is kept as documentation) or in a plain
//! `recipe.yaml`/`recipe.yml`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::RecipeError;

/// Longest run any recipe may ask for: one day
pub const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Metadata file names recognised inside a bundle directory, in lookup order
pub const METADATA_FILES: &[&str] = &["recipe.md", "recipe.yaml", "recipe.yml"];

const INPUT_TYPES: &[&str] = &["string", "number", "integer", "boolean", "array", "object"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipeKind {
    #[default]
    Atomic,
    Workflow,
}

impl fmt::Display for RecipeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecipeKind::Atomic => f.write_str("atomic"),
            RecipeKind::Workflow => f.write_str("workflow"),
        }
    }
}

/// How a recipe's payload is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Runtime {
    #[serde(rename = "chrome-js", alias = "chrome_js", alias = "javascript")]
    ChromeJs,
    #[serde(rename = "python")]
    Python,
    #[serde(rename = "shell", alias = "bash")]
    Shell,
}

impl Runtime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Runtime::ChromeJs => "chrome-js",
            Runtime::Python => "python",
            Runtime::Shell => "shell",
        }
    }

    pub fn payload_extension(&self) -> &'static str {
        match self {
            Runtime::ChromeJs => "js",
            Runtime::Python => "py",
            Runtime::Shell => "sh",
        }
    }

    /// Payload file name inside a bundle directory
    pub fn payload_file(&self) -> String {
        format!("recipe.{}", self.payload_extension())
    }

    /// Whether the payload runs in a child process rather than in the page
    pub fn is_external(&self) -> bool {
        !matches!(self, Runtime::ChromeJs)
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputTarget {
    Stdout,
    File,
    Clipboard,
}

impl OutputTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputTarget::Stdout => "stdout",
            OutputTarget::File => "file",
            OutputTarget::Clipboard => "clipboard",
        }
    }
}

impl FromStr for OutputTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(OutputTarget::Stdout),
            "file" => Ok(OutputTarget::File),
            "clipboard" => Ok(OutputTarget::Clipboard),
            other => Err(format!("unknown output target '{}'", other)),
        }
    }
}

impl fmt::Display for OutputTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    #[serde(rename = "type", default = "default_input_type")]
    pub value_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_input_type() -> String {
    "string".to_string()
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OutputSpec {
    #[serde(rename = "type", default)]
    pub value_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EnvVarSpec {
    #[serde(default)]
    pub required: bool,
    #[serde(default, deserialize_with = "scalar_string")]
    pub default: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", alias = "kind")]
    pub kind: RecipeKind,
    pub runtime: Runtime,
    #[serde(default, deserialize_with = "scalar_string")]
    pub version: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub use_cases: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputSpec>,
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputSpec>,
    #[serde(default)]
    pub env: BTreeMap<String, EnvVarSpec>,
    #[serde(default = "default_output_targets")]
    pub output_targets: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Seconds
    #[serde(default)]
    pub timeout: Option<u64>,
}

fn default_output_targets() -> Vec<String> {
    vec!["stdout".to_string()]
}

/// Accept YAML scalars like `1.0` or `true` where a string is expected
fn scalar_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

impl RecipeMetadata {
    /// Declared output targets that parse; unknown names are reported by `validate`
    pub fn declared_targets(&self) -> Vec<OutputTarget> {
        self.output_targets
            .iter()
            .filter_map(|t| t.parse().ok())
            .collect()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }

    /// Check the document against the structural rules; returns every violation
    pub fn validate(&self, requested_name: &str, payload: &Path) -> Result<(), Vec<String>> {
        let mut reasons = Vec::new();

        if self.name.trim().is_empty() {
            reasons.push("name is missing".to_string());
        } else if self.name != requested_name {
            reasons.push(format!(
                "name '{}' does not match requested name '{}'",
                self.name, requested_name
            ));
        }

        for (input, spec) in &self.inputs {
            if !INPUT_TYPES.contains(&spec.value_type.as_str()) {
                reasons.push(format!(
                    "input '{}' has unsupported type '{}'",
                    input, spec.value_type
                ));
            } else if let Some(default) = &spec.default {
                if !value_matches(&spec.value_type, default) {
                    reasons.push(format!(
                        "default of input '{}' is not of type {}",
                        input, spec.value_type
                    ));
                }
            }
        }

        for var in self.env.keys() {
            if !is_env_identifier(var) {
                reasons.push(format!("env name '{}' is not a valid identifier", var));
            }
        }

        for target in &self.output_targets {
            if let Err(e) = target.parse::<OutputTarget>() {
                reasons.push(e);
            }
        }

        match self.kind {
            RecipeKind::Workflow if !self.runtime.is_external() => {
                reasons.push(format!(
                    "workflow recipes need an interpreter runtime, not {}",
                    self.runtime
                ));
            }
            RecipeKind::Atomic if !self.dependencies.is_empty() => {
                reasons.push("atomic recipes cannot declare dependencies".to_string());
            }
            _ => {}
        }

        match self.timeout {
            Some(0) => reasons.push("timeout must be at least one second".to_string()),
            Some(secs) if secs > MAX_TIMEOUT_SECS => reasons.push(format!(
                "timeout must be at most {} seconds, got {}",
                MAX_TIMEOUT_SECS, secs
            )),
            _ => {}
        }

        if !payload.is_file() {
            reasons.push(format!("payload {} does not exist", payload.display()));
        }

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(reasons)
        }
    }

    /// Check caller params against the declared inputs and fill in defaults
    pub fn check_params(&self, params: &Value) -> Result<Value, Vec<String>> {
        let mut checked = match params {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            other => {
                return Err(vec![format!(
                    "params must be a JSON object, got {}",
                    json_type_name(other)
                )])
            }
        };

        let mut reasons = Vec::new();
        for (input, spec) in &self.inputs {
            match checked.get(input) {
                Some(value) if !value.is_null() => {
                    if !value_matches(&spec.value_type, value) {
                        reasons.push(format!(
                            "input '{}' expects {}, got {}",
                            input,
                            spec.value_type,
                            json_type_name(value)
                        ));
                    }
                }
                _ => {
                    if let Some(default) = &spec.default {
                        checked.insert(input.clone(), default.clone());
                    } else if spec.required {
                        reasons.push(format!("required input '{}' is missing", input));
                    }
                }
            }
        }

        if reasons.is_empty() {
            Ok(Value::Object(checked))
        } else {
            Err(reasons)
        }
    }
}

fn value_matches(value_type: &str, value: &Value) -> bool {
    match value_type {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => false,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_env_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Split a markdown document into YAML front matter and body
fn split_front_matter(content: &str) -> Option<(&str, &str)> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let rest = content
        .strip_prefix("---\r\n")
        .or_else(|| content.strip_prefix("---\n"))?;

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        let trimmed = line.trim_end();
        if trimmed == "---" || trimmed == "..." {
            return Some((&rest[..offset], &rest[offset + line.len()..]));
        }
        offset += line.len();
    }
    None
}

/// Parse a metadata document; returns the metadata and any markdown body
pub fn parse_document(
    path: &Path,
    name: &str,
) -> Result<(RecipeMetadata, Option<String>), RecipeError> {
    let content = std::fs::read_to_string(path).map_err(|e| RecipeError::io(path, e))?;
    let invalid = |reason: String| RecipeError::Validation {
        name: name.to_string(),
        path: path.to_path_buf(),
        reasons: vec![reason],
    };

    let is_markdown = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("md"))
        .unwrap_or(false);

    let (yaml, documentation) = if is_markdown {
        let (front, body) = split_front_matter(&content)
            .ok_or_else(|| invalid("markdown metadata has no YAML front matter".to_string()))?;
        let body = body.trim();
        (front, (!body.is_empty()).then(|| body.to_string()))
    } else {
        (content.as_str(), None)
    };

    let metadata: RecipeMetadata =
        serde_yaml::from_str(yaml).map_err(|e| invalid(format!("malformed metadata: {}", e)))?;

    Ok((metadata, documentation))
}
