//! Capability policy: the pure decision between Allow, RequireConfirmation and
//! Deny for one proposed action.
//!
//! Gates run in a fixed order and the first one that decides wins:
//!
//! 1. the absolute blocklist (and the unclassifiable-input check that backs it),
//! 2. the write-capability gate,
//! 3. the confirmation gate (the action's flag, then the confirmation rules),
//! 4. otherwise Allow.
//!
//! The engine holds no mutable state, so the same inputs always produce the
//! same verdict. Verdicts are computed fresh for every attempt.

mod rules;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::PolicyConfig;
use crate::error::ConfigError;
use crate::model::ModelProfile;
use crate::skills::{ActionCategory, ActionDescriptor, BoundParams};

pub use self::rules::{
    BlockRule, Blocklist, ConfirmationRule, ConfirmationRules, ModelTrust, Unclassifiable,
    classify,
};

/// Why an attempt was denied. Carries rule names, never the matched text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DenyReason {
    /// Matched a rule of the absolute blocklist.
    Blocklisted { rule: String },
    /// Input could not be classified reliably.
    Unclassifiable { detail: String },
    /// A write action proposed under a read-only model.
    ReadOnlyModel,
    /// The proposal named no registered action.
    UnknownAction { tool: String },
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocklisted { rule } => write!(f, "blocked by safety rule `{rule}`"),
            Self::Unclassifiable { detail } => write!(f, "cannot classify action safely: {detail}"),
            Self::ReadOnlyModel => write!(f, "model is read-only"),
            Self::UnknownAction { tool } => write!(f, "unknown action `{tool}`"),
        }
    }
}

/// Outcome of [`PolicyEngine::evaluate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyVerdict {
    Allow,
    RequireConfirmation { description: String },
    Deny(DenyReason),
}

impl PolicyVerdict {
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }

    pub fn is_deny(&self) -> bool {
        matches!(self, Self::Deny(_))
    }

    pub fn kind(&self) -> VerdictKind {
        match self {
            Self::Allow => VerdictKind::Allow,
            Self::RequireConfirmation { .. } => VerdictKind::RequireConfirmation,
            Self::Deny(_) => VerdictKind::Deny,
        }
    }
}

impl fmt::Display for PolicyVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::RequireConfirmation { description } => {
                write!(f, "require confirmation: {description}")
            }
            Self::Deny(reason) => write!(f, "deny: {reason}"),
        }
    }
}

/// Verdict discriminant, used in audit records and filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictKind {
    Allow,
    RequireConfirmation,
    Deny,
}

/// The capability policy engine.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    blocklist: Blocklist,
    confirmations: ConfirmationRules,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyEngine {
    /// Engine with the built-in rule sets only.
    pub fn new() -> Self {
        Self {
            blocklist: Blocklist::builtin(),
            confirmations: ConfirmationRules::builtin(),
        }
    }

    pub fn from_config(config: &PolicyConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            blocklist: Blocklist::with_extra(&config.extra_blocked_patterns)?,
            confirmations: ConfirmationRules::with_extra(&config.extra_confirmation_patterns)?,
        })
    }

    pub fn blocklist(&self) -> &Blocklist {
        &self.blocklist
    }

    /// Decide whether `action` may run with `params` under `model`.
    pub fn evaluate(
        &self,
        action: &ActionDescriptor,
        model: &ModelProfile,
        params: &BoundParams,
    ) -> PolicyVerdict {
        // 1. Absolute blocklist. Fails closed on anything unclassifiable.
        let mut strings = Vec::new();
        params.visit_strings(|s| strings.push(s));
        for text in &strings {
            if let Err(why) = classify(text) {
                return PolicyVerdict::Deny(DenyReason::Unclassifiable {
                    detail: why.describe().into(),
                });
            }
            if let Some(rule) = self.blocklist.first_match(text) {
                return PolicyVerdict::Deny(DenyReason::Blocklisted { rule: rule.into() });
            }
        }

        // 2. Write-capability gate.
        if action.category == ActionCategory::Write && !model.write_capable {
            return PolicyVerdict::Deny(DenyReason::ReadOnlyModel);
        }

        // 3. Confirmation gate.
        if action.confirmation_required {
            return PolicyVerdict::RequireConfirmation {
                description: default_description(action, params),
            };
        }
        if let Some(description) = strings.iter().find_map(|t| self.confirmations.first_match(t)) {
            return PolicyVerdict::RequireConfirmation {
                description: format!("{description}: {}", default_description(action, params)),
            };
        }

        PolicyVerdict::Allow
    }
}

/// "Run postgres.query (sql, database)" style summary for prompts.
fn default_description(action: &ActionDescriptor, params: &BoundParams) -> String {
    let base = if action.description.is_empty() {
        format!("Run {}", action.qualified_name())
    } else {
        format!("{} ({})", action.description, action.qualified_name())
    };
    if params.is_empty() {
        base
    } else {
        let names: Vec<&str> = params.iter().map(|(k, _)| k.as_str()).collect();
        format!("{base} with {}", names.join(", "))
    }
}
