//! The skill registry and its hot-reload handle.
//!
//! A [`Registry`] is built in one go from a set of sources and never mutated
//! afterwards. Sessions take an `Arc<Registry>` snapshot from the
//! [`RegistryHandle`] per lookup; a reload builds a complete new registry and
//! swaps the pointer, so a lookup sees either the old registry or the new one,
//! never a mix.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::LoadError;

use super::capability::CapabilityBindings;
use super::loader::{self, SkillSource};
use super::{ActionDescriptor, Skill, TOOL_NAME_SEPARATOR};

/// Immutable set of loaded skills.
#[derive(Debug)]
pub struct Registry {
    skills: BTreeMap<String, Skill>,
    loaded_at: DateTime<Utc>,
}

impl Registry {
    /// A registry with no skills.
    pub fn empty() -> Self {
        Self {
            skills: BTreeMap::new(),
            loaded_at: Utc::now(),
        }
    }

    /// Build a registry from sources. Any malformed source fails the whole
    /// load.
    pub fn load(sources: &[SkillSource], bindings: &CapabilityBindings) -> Result<Self, LoadError> {
        let mut skills: BTreeMap<String, Skill> = BTreeMap::new();
        for source in sources {
            let skill = loader::resolve(source, bindings)?;
            if let Some(existing) = skills.get(&skill.name) {
                return Err(LoadError::DuplicateSkill {
                    skill: skill.name,
                    first_origin: existing.origin.clone(),
                });
            }
            tracing::info!(
                skill = skill.name.as_str(),
                actions = skill.actions.len(),
                origin = source.origin.as_str(),
                "loaded skill"
            );
            skills.insert(skill.name.clone(), skill);
        }
        Ok(Self {
            skills,
            loaded_at: Utc::now(),
        })
    }

    /// Load every definition file found in `dirs`. Missing directories are
    /// skipped with a warning.
    pub fn from_dirs(dirs: &[PathBuf], bindings: &CapabilityBindings) -> Result<Self, LoadError> {
        let mut sources = Vec::new();
        for dir in dirs {
            if !dir.exists() {
                tracing::warn!(dir = %dir.display(), "skills directory not found, skipping");
                continue;
            }
            sources.extend(loader::discover(dir)?);
        }
        Self::load(&sources, bindings)
    }

    /// Keep only the named skills. An empty list keeps everything.
    pub fn retain_enabled(mut self, enabled: &[String]) -> Self {
        if !enabled.is_empty() {
            self.skills.retain(|name, _| enabled.iter().any(|e| e == name));
        }
        self
    }

    pub fn lookup(&self, skill: &str, action: &str) -> Option<Arc<ActionDescriptor>> {
        self.skills.get(skill)?.action(action).cloned()
    }

    /// Look up by `skill__action` tool name.
    pub fn lookup_tool(&self, tool_name: &str) -> Option<Arc<ActionDescriptor>> {
        let (skill, action) = tool_name.split_once(TOOL_NAME_SEPARATOR)?;
        self.lookup(skill, action)
    }

    pub fn skill(&self, name: &str) -> Option<&Skill> {
        self.skills.get(name)
    }

    /// Skills in name order.
    pub fn skills(&self) -> impl Iterator<Item = &Skill> {
        self.skills.values()
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    pub fn action_count(&self) -> usize {
        self.skills.values().map(|s| s.actions.len()).sum()
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// OpenAI function-calling definitions for every action.
    pub fn tool_definitions(&self) -> Vec<Value> {
        self.skills
            .values()
            .flat_map(|s| s.actions.iter().map(|a| a.tool_definition()))
            .collect()
    }

    /// Markdown summary of skills for the system prompt.
    pub fn describe(&self) -> String {
        if self.skills.is_empty() {
            return "No skills loaded.".into();
        }
        let mut lines = Vec::new();
        for skill in self.skills.values() {
            lines.push(format!("- **{}**: {}", skill.name, skill.description));
            for action in &skill.actions {
                let confirm = if action.confirmation_required {
                    " (requires confirmation)"
                } else {
                    ""
                };
                lines.push(format!(
                    "  - `{}` [{}]: {}{confirm}",
                    action.name, action.category, action.description
                ));
            }
        }
        lines.join("\n")
    }
}

/// Shared pointer to the current registry, replaced wholesale on reload.
#[derive(Debug)]
pub struct RegistryHandle {
    current: RwLock<Arc<Registry>>,
    generation: AtomicU64,
}

impl RegistryHandle {
    pub fn new(registry: Registry) -> Self {
        Self {
            current: RwLock::new(Arc::new(registry)),
            generation: AtomicU64::new(1),
        }
    }

    /// The registry as of now. Holding the snapshot keeps it alive across a
    /// concurrent reload.
    pub fn snapshot(&self) -> Arc<Registry> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap in a new registry. Returns the new generation number.
    pub fn replace(&self, registry: Registry) -> u64 {
        let next = Arc::new(registry);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next;
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Rebuild from directories and swap. On error the current registry
    /// stays in place.
    pub fn reload(
        &self,
        dirs: &[PathBuf],
        bindings: &CapabilityBindings,
        enabled: &[String],
    ) -> Result<u64, LoadError> {
        match Registry::from_dirs(dirs, bindings) {
            Ok(registry) => {
                let registry = registry.retain_enabled(enabled);
                let skills = registry.len();
                let generation = self.replace(registry);
                tracing::info!(generation, skills, "skill registry reloaded");
                Ok(generation)
            }
            Err(e) => {
                tracing::warn!(error = %e, "skill registry reload failed, keeping current registry");
                Err(e)
            }
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(name: &str, actions: &[(&str, &str, bool)]) -> SkillSource {
        let mut text = format!("---\nname: {name}\ndescription: {name} skill\nactions:\n");
        for (action, category, confirm) in actions {
            text.push_str(&format!(
                "  - {{name: {action}, description: do {action}, category: {category}, confirmation_required: {confirm}, exec: {{shell: 'true'}}}}\n"
            ));
        }
        text.push_str("---\n");
        SkillSource::markdown(name, text)
    }

    #[test]
    fn lookup_by_name_and_tool_name() {
        let registry = Registry::load(
            &[source("postgres", &[("query", "write", true), ("stats", "read", false)])],
            &CapabilityBindings::new(),
        )
        .unwrap();
        assert!(registry.lookup("postgres", "query").is_some());
        assert!(registry.lookup("postgres", "drop").is_none());
        assert!(registry.lookup("docker", "query").is_none());
        assert_eq!(
            registry.lookup_tool("postgres__stats").unwrap().name,
            "stats"
        );
        assert!(registry.lookup_tool("postgres.stats").is_none());
        assert_eq!(registry.action_count(), 2);
    }

    #[test]
    fn duplicate_skill_across_sources_fails() {
        let err = Registry::load(
            &[
                source("docker", &[("ps", "read", false)]),
                source("docker", &[("logs", "read", false)]),
            ],
            &CapabilityBindings::new(),
        )
        .unwrap_err();
        assert!(matches!(err, LoadError::DuplicateSkill { .. }));
    }

    #[test]
    fn retain_enabled_filters_skills() {
        let registry = Registry::load(
            &[
                source("docker", &[("ps", "read", false)]),
                source("logs", &[("tail", "read", false)]),
            ],
            &CapabilityBindings::new(),
        )
        .unwrap()
        .retain_enabled(&["logs".to_string()]);
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup("docker", "ps").is_none());
    }

    #[test]
    fn describe_marks_confirmation() {
        let registry = Registry::load(
            &[source("postgres", &[("query", "write", true)])],
            &CapabilityBindings::new(),
        )
        .unwrap();
        let text = registry.describe();
        assert!(text.contains("**postgres**"));
        assert!(text.contains("`query` [write]"));
        assert!(text.contains("(requires confirmation)"));
        assert_eq!(Registry::empty().describe(), "No skills loaded.");
    }

    #[test]
    fn snapshot_survives_replace() {
        let handle = RegistryHandle::new(
            Registry::load(
                &[source("docker", &[("ps", "read", false)])],
                &CapabilityBindings::new(),
            )
            .unwrap(),
        );
        let old = handle.snapshot();
        let generation = handle.replace(Registry::empty());
        assert_eq!(generation, 2);
        assert!(old.lookup("docker", "ps").is_some());
        assert!(handle.snapshot().lookup("docker", "ps").is_none());
    }

    #[test]
    fn failed_reload_keeps_current() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("ok.skill.md"),
            source("docker", &[("ps", "read", false)]).text,
        )
        .unwrap();
        let handle = RegistryHandle::new(Registry::empty());
        let dirs = vec![dir.path().to_path_buf()];
        handle.reload(&dirs, &CapabilityBindings::new(), &[]).unwrap();
        assert_eq!(handle.snapshot().len(), 1);

        std::fs::write(dir.path().join("bad.skill.md"), "no frontmatter").unwrap();
        assert!(handle.reload(&dirs, &CapabilityBindings::new(), &[]).is_err());
        assert!(handle.snapshot().lookup("docker", "ps").is_some());
        assert_eq!(handle.generation(), 2);
    }
}
