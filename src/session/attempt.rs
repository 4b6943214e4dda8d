//! One proposed invocation, from policy check to audit record.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditOutcome};
use crate::policy::{DenyReason, PolicyVerdict, VerdictKind};
use crate::skills::params::REDACTED;
use crate::skills::{ActionDescriptor, BoundParams, TOOL_NAME_SEPARATOR};

use super::ToolCallRecord;

/// Everything the audit record of an attempt needs, carried through the
/// session as the attempt moves between phases.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub call: ToolCallRecord,
    pub skill: String,
    pub action: String,
    /// Resolved descriptor. `None` when the proposal named no known action.
    pub descriptor: Option<Arc<ActionDescriptor>>,
    pub params: BoundParams,
    pub verdict: VerdictKind,
    pub deny_reason: Option<DenyReason>,
    pub confirm_id: Option<String>,
}

impl Attempt {
    pub fn new(call: ToolCallRecord, descriptor: Option<Arc<ActionDescriptor>>, params: BoundParams) -> Self {
        let (skill, action) = match &descriptor {
            Some(d) => (d.skill.clone(), d.name.clone()),
            None => split_tool_name(&call.tool),
        };
        Self {
            call,
            skill,
            action,
            descriptor,
            params,
            verdict: VerdictKind::Deny,
            deny_reason: None,
            confirm_id: None,
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.skill, self.action)
    }

    /// Record the verdict computed for this attempt.
    pub fn set_verdict(&mut self, verdict: &PolicyVerdict) {
        self.verdict = verdict.kind();
        self.deny_reason = match verdict {
            PolicyVerdict::Deny(reason) => Some(reason.clone()),
            _ => None,
        };
    }

    /// Parameters safe to show and store. Without a descriptor nothing is
    /// known about sensitivity, so every value is redacted.
    pub fn redacted_params(&self) -> Map<String, Value> {
        match &self.descriptor {
            Some(d) => self.params.redacted(d),
            None => self
                .params
                .iter()
                .map(|(k, _)| (k.clone(), Value::String(REDACTED.into())))
                .collect(),
        }
    }

    pub fn audit_entry(
        &self,
        session: &SessionIdentity<'_>,
        outcome: AuditOutcome,
        detail: Option<&str>,
        duration_ms: Option<u64>,
    ) -> AuditEntry {
        AuditEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            session_id: session.session_id.into(),
            user_id: session.user_id.into(),
            model_id: session.model_id.into(),
            skill: self.skill.clone(),
            action: self.action.clone(),
            params: self.redacted_params(),
            verdict: self.verdict,
            deny_reason: self.deny_reason.clone(),
            confirm_id: self.confirm_id.clone(),
            outcome,
            detail: detail.map(AuditEntry::summarize),
            duration_ms,
        }
    }
}

/// Who an attempt ran for.
#[derive(Debug, Clone, Copy)]
pub struct SessionIdentity<'a> {
    pub session_id: &'a str,
    pub user_id: &'a str,
    pub model_id: &'a str,
}

/// `skill__action` → (`skill`, `action`). A name without the separator is
/// all skill.
pub fn split_tool_name(tool: &str) -> (String, String) {
    match tool.split_once(TOOL_NAME_SEPARATOR) {
        Some((skill, action)) => (skill.to_string(), action.to_string()),
        None => (tool.to_string(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skills::ActionCategory;
    use crate::skills::testing::{descriptor, string_param};

    fn call(tool: &str) -> ToolCallRecord {
        ToolCallRecord {
            id: "c1".into(),
            tool: tool.into(),
            arguments: "{}".into(),
        }
    }

    #[test]
    fn unknown_action_redacts_everything() {
        let attempt = Attempt::new(
            call("vault__read"),
            None,
            BoundParams::default().with("path", "secret/db"),
        );
        assert_eq!(attempt.skill, "vault");
        assert_eq!(attempt.action, "read");
        assert_eq!(attempt.redacted_params()["path"], REDACTED);
    }

    #[test]
    fn known_action_redacts_sensitive_only() {
        let mut password = string_param("password", true);
        password.sensitive = true;
        let d = Arc::new(descriptor(
            "pg",
            "login",
            ActionCategory::Read,
            false,
            vec![string_param("user", true), password],
        ));
        let mut attempt = Attempt::new(
            call("pg__login"),
            Some(d),
            BoundParams::default().with("user", "app").with("password", "hunter2"),
        );
        attempt.set_verdict(&PolicyVerdict::Allow);
        let entry = attempt.audit_entry(
            &SessionIdentity {
                session_id: "s",
                user_id: "u",
                model_id: "m",
            },
            AuditOutcome::Success,
            Some("ok"),
            Some(4),
        );
        assert_eq!(entry.params["user"], "app");
        assert_eq!(entry.params["password"], REDACTED);
        assert_eq!(entry.verdict, VerdictKind::Allow);
        assert!(entry.deny_reason.is_none());
    }

    #[test]
    fn split_without_separator() {
        assert_eq!(split_tool_name("ls"), ("ls".into(), String::new()));
    }
}
