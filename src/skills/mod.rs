//! Skills: named bundles of privileged actions.
//!
//! A [`Skill`] groups [`ActionDescriptor`]s. Descriptors are resolved once at
//! load time: their parameter schema is typed, their category is fixed, and
//! their capability callable is bound. Nothing downstream dispatches on
//! action-name strings.
//!
//! Lifecycle: declarative source → [`loader`] → [`registry::Registry`] (immutable)
//! → [`registry::RegistryHandle`] (atomic swap on reload).

pub mod capability;
pub mod loader;
pub mod params;
pub mod registry;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use self::capability::Capability;

pub use self::params::{BoundParams, ValidatedParams};
pub use self::registry::{Registry, RegistryHandle};

/// Separator between skill and action in model-facing tool names.
pub const TOOL_NAME_SEPARATOR: &str = "__";

/// Declared side-effect class of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionCategory {
    /// Observes state only.
    Read,
    /// May mutate infrastructure. Needs a write-capable model.
    Write,
}

impl ActionCategory {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            _ => None,
        }
    }
}

impl fmt::Display for ActionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// JSON type of an action parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "string" => Some(Self::String),
            "integer" => Some(Self::Integer),
            "number" => Some(Self::Number),
            "boolean" => Some(Self::Boolean),
            "array" => Some(Self::Array),
            "object" => Some(Self::Object),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    /// Whether a JSON value has this type. Integers count as numbers.
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Schema entry for one action parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamSpec {
    pub name: String,
    pub ty: ParamType,
    pub description: String,
    pub required: bool,
    pub default: Option<Value>,
    /// Allowed values, when the parameter is an enumeration.
    pub allowed: Option<Vec<Value>>,
    /// Redacted in audit records.
    pub sensitive: bool,
}

/// A single invocable operation, resolved and bound to its capability.
pub struct ActionDescriptor {
    pub skill: String,
    pub name: String,
    pub description: String,
    pub category: ActionCategory,
    pub confirmation_required: bool,
    /// Per-action deadline. The executor's default applies when `None`.
    pub timeout: Option<Duration>,
    pub params: Vec<ParamSpec>,
    pub capability: Arc<dyn Capability>,
}

impl ActionDescriptor {
    /// `skill.action`, the name used in logs and audit records.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.skill, self.name)
    }

    /// `skill__action`, the function name presented to the model.
    pub fn tool_name(&self) -> String {
        format!("{}{TOOL_NAME_SEPARATOR}{}", self.skill, self.name)
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn is_sensitive(&self, name: &str) -> bool {
        self.param(name).is_some_and(|p| p.sensitive)
    }

    /// OpenAI function-calling tool definition for this action.
    pub fn tool_definition(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in &self.params {
            let mut prop = serde_json::Map::new();
            prop.insert("type".into(), Value::String(param.ty.as_str().into()));
            prop.insert("description".into(), Value::String(param.description.clone()));
            if let Some(allowed) = &param.allowed {
                prop.insert("enum".into(), Value::Array(allowed.clone()));
            }
            if let Some(default) = &param.default {
                prop.insert("default".into(), default.clone());
            }
            properties.insert(param.name.clone(), Value::Object(prop));
            if param.required {
                required.push(Value::String(param.name.clone()));
            }
        }

        let mut parameters = serde_json::json!({
            "type": "object",
            "properties": properties,
        });
        if !required.is_empty() {
            parameters["required"] = Value::Array(required);
        }

        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.tool_name(),
                "description": self.description,
                "parameters": parameters,
            }
        })
    }
}

impl fmt::Debug for ActionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDescriptor")
            .field("skill", &self.skill)
            .field("name", &self.name)
            .field("category", &self.category)
            .field("confirmation_required", &self.confirmation_required)
            .field("timeout", &self.timeout)
            .field("params", &self.params)
            .field("capability", &self.capability.describe())
            .finish()
    }
}

/// A loaded skill. Immutable once the registry is built.
#[derive(Debug)]
pub struct Skill {
    pub name: String,
    pub description: String,
    /// Free-form documentation that followed the definition.
    pub docs: String,
    /// Where the definition came from (file path or inline label).
    pub origin: String,
    pub path: Option<PathBuf>,
    pub actions: Vec<Arc<ActionDescriptor>>,
}

impl Skill {
    pub fn action(&self, name: &str) -> Option<&Arc<ActionDescriptor>> {
        self.actions.iter().find(|a| a.name == name)
    }
}

/// Check a skill or action name: `[A-Za-z0-9_.-]+` without `__` and without
/// a leading or trailing `_`, so `skill__action` splits one way only.
pub(crate) fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains(TOOL_NAME_SEPARATOR)
        && !name.starts_with('_')
        && !name.ends_with('_')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

#[cfg(test)]
pub(crate) mod testing {
    //! Descriptor builders shared by unit tests across modules.

    use super::*;
    use crate::skills::capability::FnCapability;

    pub fn string_param(name: &str, required: bool) -> ParamSpec {
        ParamSpec {
            name: name.into(),
            ty: ParamType::String,
            description: String::new(),
            required,
            default: None,
            allowed: None,
            sensitive: false,
        }
    }

    pub fn descriptor(
        skill: &str,
        name: &str,
        category: ActionCategory,
        confirmation_required: bool,
        params: Vec<ParamSpec>,
    ) -> ActionDescriptor {
        ActionDescriptor {
            skill: skill.into(),
            name: name.into(),
            description: format!("{name} on {skill}"),
            category,
            confirmation_required,
            timeout: None,
            params,
            capability: Arc::new(FnCapability::new(|_params, _cancel| async {
                Ok("ok".to_string())
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn param_type_matching() {
        assert!(ParamType::Integer.matches(&serde_json::json!(3)));
        assert!(!ParamType::Integer.matches(&serde_json::json!(3.5)));
        assert!(ParamType::Number.matches(&serde_json::json!(3)));
        assert!(ParamType::String.matches(&serde_json::json!("x")));
        assert!(!ParamType::Boolean.matches(&serde_json::json!("true")));
        assert_eq!(ParamType::parse("uuid"), None);
    }

    #[test]
    fn names_reject_separator_and_symbols() {
        assert!(is_valid_name("postgresql-ops"));
        assert!(is_valid_name("list_tables"));
        assert!(!is_valid_name("bad__name"));
        assert!(!is_valid_name("has space"));
        assert!(!is_valid_name(""));
    }

    #[test]
    fn names_cannot_make_the_tool_name_ambiguous() {
        assert!(!is_valid_name("x_"));
        assert!(!is_valid_name("_y"));
        assert!(is_valid_name("x_y"));

        // `x_` + `_y` and `x` + `__y` would both give `x___y`.
        let d = descriptor("x", "y_z", ActionCategory::Read, false, vec![]);
        let tool = d.tool_name();
        let (skill, action) = tool.split_once(TOOL_NAME_SEPARATOR).unwrap();
        assert_eq!((skill, action), ("x", "y_z"));
    }

    #[test]
    fn tool_definition_lists_required_params() {
        let d = descriptor(
            "postgres",
            "query",
            ActionCategory::Write,
            true,
            vec![string_param("sql", true), string_param("database", false)],
        );
        let def = d.tool_definition();
        assert_eq!(def["function"]["name"], "postgres__query");
        assert_eq!(def["function"]["parameters"]["required"], serde_json::json!(["sql"]));
        assert_eq!(
            def["function"]["parameters"]["properties"]["database"]["type"],
            "string"
        );
    }

    #[test]
    fn qualified_and_tool_names() {
        let d = descriptor("docker", "logs", ActionCategory::Read, false, vec![]);
        assert_eq!(d.qualified_name(), "docker.logs");
        assert_eq!(d.tool_name(), "docker__logs");
    }
}
