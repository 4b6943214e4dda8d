//! Schema validation of proposed parameters.

use std::collections::BTreeMap;

use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;

use crate::skills::params::json_kind;
use crate::skills::{ActionDescriptor, BoundParams, ValidatedParams};

/// Malformed parameters. Reported to the caller; nothing is invoked.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum ValidationError {
    #[error("malformed arguments: {message}")]
    #[diagnostic(
        code(colonel::validation::malformed),
        help("Tool call arguments must be a JSON object.")
    )]
    MalformedArguments { message: String },

    #[error("{action}: missing required parameter `{param}`")]
    #[diagnostic(code(colonel::validation::missing))]
    MissingParameter { action: String, param: String },

    #[error("{action}: parameter `{param}` must be {expected}, got {actual}")]
    #[diagnostic(code(colonel::validation::wrong_type))]
    WrongType {
        action: String,
        param: String,
        expected: String,
        actual: String,
    },

    #[error("{action}: parameter `{param}` must be one of {allowed}")]
    #[diagnostic(code(colonel::validation::not_allowed))]
    NotAllowed {
        action: String,
        param: String,
        allowed: String,
    },

    #[error("{action}: unknown parameter `{param}`")]
    #[diagnostic(
        code(colonel::validation::unknown),
        help("Only parameters declared in the action's schema are accepted.")
    )]
    UnknownParameter { action: String, param: String },
}

/// Check `params` against the action's schema and fill in defaults.
///
/// A `null` value for an optional parameter counts as absent.
pub fn validate(
    action: &ActionDescriptor,
    params: &BoundParams,
) -> Result<ValidatedParams, ValidationError> {
    let qualified = action.qualified_name();
    let mut values = BTreeMap::new();

    for (name, value) in params.iter() {
        let Some(spec) = action.param(name) else {
            return Err(ValidationError::UnknownParameter {
                action: qualified,
                param: name.clone(),
            });
        };
        if value.is_null() && !spec.required {
            continue;
        }
        if !spec.ty.matches(value) {
            return Err(ValidationError::WrongType {
                action: qualified,
                param: name.clone(),
                expected: spec.ty.to_string(),
                actual: json_kind(value).into(),
            });
        }
        if let Some(allowed) = &spec.allowed {
            if !allowed.contains(value) {
                return Err(ValidationError::NotAllowed {
                    action: qualified,
                    param: name.clone(),
                    allowed: Value::Array(allowed.clone()).to_string(),
                });
            }
        }
        values.insert(name.clone(), value.clone());
    }

    for spec in &action.params {
        if values.contains_key(&spec.name) {
            continue;
        }
        match (&spec.default, spec.required) {
            (_, true) => {
                return Err(ValidationError::MissingParameter {
                    action: qualified,
                    param: spec.name.clone(),
                });
            }
            (Some(default), false) => {
                values.insert(spec.name.clone(), default.clone());
            }
            (None, false) => {}
        }
    }

    Ok(ValidatedParams::new(values))
}
