//! Declarative skill definitions and their resolution into typed descriptors.
//!
//! Two source formats carry the same structure:
//!
//! - `*.skill.md`: YAML frontmatter between `---` lines, followed by free-form
//!   documentation;
//! - `*.skill.toml`: the same fields as a TOML document (documentation goes in
//!   an optional `docs` field).
//!
//! ```yaml
//! ---
//! name: postgresql-ops
//! description: Inspect and query PostgreSQL
//! actions:
//!   - name: query
//!     description: Run a SQL statement
//!     category: write
//!     confirmation_required: true
//!     timeout_seconds: 20
//!     parameters:
//!       sql: { type: string, required: true, description: Statement to run }
//!     exec: { program: psql, args: ["-c", "{sql}"] }
//! ---
//! Notes for operators.
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::error::LoadError;

use super::capability::{Capability, CapabilityBindings, ExecSpec, ProcessCapability};
use super::{ActionCategory, ActionDescriptor, ParamSpec, ParamType, Skill, is_valid_name};

/// Source text format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Markdown,
    Toml,
}

impl SourceFormat {
    /// Recognise a definition file by its double extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        if name.ends_with(".skill.md") {
            Some(Self::Markdown)
        } else if name.ends_with(".skill.toml") {
            Some(Self::Toml)
        } else {
            None
        }
    }
}

/// One skill definition, read but not yet parsed.
#[derive(Debug, Clone)]
pub struct SkillSource {
    /// Label for diagnostics: the file path or an inline name.
    pub origin: String,
    pub path: Option<PathBuf>,
    pub format: SourceFormat,
    pub text: String,
}

impl SkillSource {
    pub fn markdown(origin: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            path: None,
            format: SourceFormat::Markdown,
            text: text.into(),
        }
    }

    pub fn toml(origin: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            path: None,
            format: SourceFormat::Toml,
            text: text.into(),
        }
    }

    /// Read a definition file. The format comes from its extension.
    pub fn from_path(path: &Path) -> Result<Self, LoadError> {
        let format = SourceFormat::from_path(path).ok_or_else(|| LoadError::Parse {
            origin: path.display().to_string(),
            message: "expected a *.skill.md or *.skill.toml file".into(),
        })?;
        let text = std::fs::read_to_string(path).map_err(|source| LoadError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self {
            origin: path.display().to_string(),
            path: Some(path.to_path_buf()),
            format,
            text,
        })
    }
}

/// List definition files in a directory, sorted by file name.
pub fn discover(dir: &Path) -> Result<Vec<SkillSource>, LoadError> {
    let entries = std::fs::read_dir(dir).map_err(|source| LoadError::Read {
        path: dir.display().to_string(),
        source,
    })?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && SourceFormat::from_path(p).is_some())
        .collect();
    paths.sort();

    paths.iter().map(|p| SkillSource::from_path(p)).collect()
}

// ── Raw definition structs ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SkillDef {
    name: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    docs: String,
    actions: Option<Vec<ActionDef>>,
}

#[derive(Debug, Deserialize)]
struct ActionDef {
    name: Option<String>,
    #[serde(default)]
    description: String,
    category: Option<String>,
    #[serde(default)]
    confirmation_required: bool,
    #[serde(default)]
    timeout_seconds: Option<u64>,
    #[serde(default)]
    parameters: BTreeMap<String, ParamDef>,
    #[serde(default)]
    exec: Option<ExecSpec>,
}

#[derive(Debug, Deserialize)]
struct ParamDef {
    #[serde(rename = "type")]
    ty: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    default: Option<Value>,
    #[serde(default, rename = "enum")]
    allowed: Option<Vec<Value>>,
    #[serde(default)]
    sensitive: bool,
}

// ── Parsing ──────────────────────────────────────────────────────────────

/// Split `---` delimited frontmatter from the documentation that follows.
fn split_frontmatter(text: &str) -> Option<(&str, &str)> {
    let text = text.trim_start_matches('\u{feff}');
    let rest = text.strip_prefix("---")?;
    let rest = rest
        .strip_prefix("\r\n")
        .or_else(|| rest.strip_prefix('\n'))?;

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            return Some((&rest[..offset], &rest[offset + line.len()..]));
        }
        offset += line.len();
    }
    None
}

fn parse_def(source: &SkillSource) -> Result<SkillDef, LoadError> {
    match source.format {
        SourceFormat::Markdown => {
            let (yaml, docs) =
                split_frontmatter(&source.text).ok_or_else(|| LoadError::MissingFrontmatter {
                    origin: source.origin.clone(),
                })?;
            let mut def: SkillDef =
                serde_yaml::from_str(yaml).map_err(|e| LoadError::Parse {
                    origin: source.origin.clone(),
                    message: e.to_string(),
                })?;
            if def.docs.is_empty() {
                def.docs = docs.trim().to_string();
            }
            Ok(def)
        }
        SourceFormat::Toml => toml::from_str(&source.text).map_err(|e| LoadError::Parse {
            origin: source.origin.clone(),
            message: e.to_string(),
        }),
    }
}

// ── Resolution ───────────────────────────────────────────────────────────

/// Parse, validate and bind one source into a [`Skill`].
pub fn resolve(source: &SkillSource, bindings: &CapabilityBindings) -> Result<Skill, LoadError> {
    let def = parse_def(source)?;

    let skill_name = match def.name {
        Some(name) if !name.trim().is_empty() => name,
        _ => {
            return Err(LoadError::MissingField {
                skill: source.origin.clone(),
                field: "name".into(),
            });
        }
    };
    if !is_valid_name(&skill_name) {
        return Err(LoadError::InvalidName {
            skill: skill_name.clone(),
            name: skill_name,
        });
    }

    let action_defs = match def.actions {
        Some(actions) if !actions.is_empty() => actions,
        _ => {
            return Err(LoadError::MissingField {
                skill: skill_name,
                field: "actions".into(),
            });
        }
    };

    let mut seen = HashSet::new();
    let mut actions = Vec::with_capacity(action_defs.len());
    for (index, action_def) in action_defs.into_iter().enumerate() {
        let action = resolve_action(&skill_name, index, action_def, bindings)?;
        if !seen.insert(action.name.clone()) {
            return Err(LoadError::DuplicateAction {
                skill: skill_name,
                action: action.name,
            });
        }
        actions.push(Arc::new(action));
    }

    Ok(Skill {
        name: skill_name,
        description: def.description,
        docs: def.docs,
        origin: source.origin.clone(),
        path: source.path.clone(),
        actions,
    })
}

fn resolve_action(
    skill: &str,
    index: usize,
    def: ActionDef,
    bindings: &CapabilityBindings,
) -> Result<ActionDescriptor, LoadError> {
    let name = match def.name {
        Some(name) if !name.trim().is_empty() => name,
        _ => {
            return Err(LoadError::MissingField {
                skill: skill.into(),
                field: format!("actions[{index}].name"),
            });
        }
    };
    if !is_valid_name(&name) {
        return Err(LoadError::InvalidName {
            skill: skill.into(),
            name,
        });
    }

    let category = match def.category {
        None => {
            return Err(LoadError::MissingField {
                skill: skill.into(),
                field: format!("actions.{name}.category"),
            });
        }
        Some(raw) => ActionCategory::parse(&raw).ok_or_else(|| LoadError::UnknownCategory {
            skill: skill.into(),
            action: name.clone(),
            category: raw,
        })?,
    };

    let params = def
        .parameters
        .into_iter()
        .map(|(param_name, p)| resolve_param(skill, &name, param_name, p))
        .collect::<Result<Vec<_>, _>>()?;

    let capability: Arc<dyn Capability> = match (bindings.get(skill, &name), def.exec) {
        (Some(bound), exec) => {
            if exec.is_some() {
                tracing::debug!(skill, action = name.as_str(), "host binding overrides exec block");
            }
            bound
        }
        (None, Some(spec)) => {
            spec.check().map_err(|message| LoadError::UnsafeExec {
                skill: skill.into(),
                action: name.clone(),
                message,
            })?;
            Arc::new(ProcessCapability::new(spec))
        }
        (None, None) => {
            return Err(LoadError::Unbound {
                skill: skill.into(),
                action: name,
            });
        }
    };

    Ok(ActionDescriptor {
        skill: skill.into(),
        name,
        description: def.description,
        category,
        confirmation_required: def.confirmation_required,
        timeout: def.timeout_seconds.map(Duration::from_secs),
        params,
        capability,
    })
}

fn resolve_param(
    skill: &str,
    action: &str,
    name: String,
    def: ParamDef,
) -> Result<ParamSpec, LoadError> {
    let raw_ty = def.ty.unwrap_or_else(|| "string".into());
    let ty = ParamType::parse(&raw_ty).ok_or_else(|| LoadError::UnknownParamType {
        skill: skill.into(),
        action: action.into(),
        param: name.clone(),
        ty: raw_ty.clone(),
    })?;

    if let Some(default) = &def.default {
        let in_enum = def.allowed.as_ref().is_none_or(|a| a.contains(default));
        if !ty.matches(default) || !in_enum {
            return Err(LoadError::InvalidDefault {
                skill: skill.into(),
                action: action.into(),
                param: name,
                expected: ty.to_string(),
            });
        }
    }

    Ok(ParamSpec {
        name,
        ty,
        description: def.description,
        required: def.required,
        default: def.default,
        allowed: def.allowed,
        sensitive: def.sensitive,
    })
}
