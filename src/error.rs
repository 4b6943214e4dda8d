//! Rich diagnostic error types for the colonel core.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes and help text so operators know exactly what went wrong
//! and how to fix it. Errors that only make sense next to their subsystem
//! (capability failures, parameter validation, audit and backend failures) live
//! in that subsystem's module and are re-exported through [`ColonelError`].

use miette::Diagnostic;
use thiserror::Error;

pub use crate::audit::AuditError;
pub use crate::executor::ValidationError;
pub use crate::model::BackendError;
pub use crate::skills::capability::CapabilityError;

/// Top-level error type for the colonel core.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain (error codes, help text) through to the operator.
#[derive(Debug, Error, Diagnostic)]
pub enum ColonelError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Capability(#[from] CapabilityError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Audit(#[from] AuditError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Session(#[from] SessionError),
}

// ---------------------------------------------------------------------------
// Skill loading errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum LoadError {
    #[error("failed to read skill source: {path}")]
    #[diagnostic(
        code(colonel::skill::read),
        help("Ensure the skill file or directory exists and is readable.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("skill source \"{origin}\" has no frontmatter")]
    #[diagnostic(
        code(colonel::skill::frontmatter),
        help(
            "A *.skill.md file must start with a YAML block delimited by `---` lines, \
             followed by optional documentation."
        )
    )]
    MissingFrontmatter { origin: String },

    #[error("failed to parse skill source \"{origin}\": {message}")]
    #[diagnostic(
        code(colonel::skill::parse),
        help("Check the YAML/TOML syntax of the skill definition.")
    )]
    Parse { origin: String, message: String },

    #[error("skill \"{skill}\" is missing required field `{field}`")]
    #[diagnostic(
        code(colonel::skill::missing_field),
        help("Every skill needs a name and at least one action; every action needs a name and a category.")
    )]
    MissingField { skill: String, field: String },

    #[error("invalid name \"{name}\" in skill \"{skill}\"")]
    #[diagnostic(
        code(colonel::skill::invalid_name),
        help(
            "Skill and action names may contain letters, digits, `_`, `-` and `.`, \
             and must not contain `__` (used to join skill and action in tool names)."
        )
    )]
    InvalidName { skill: String, name: String },

    #[error("duplicate action \"{action}\" in skill \"{skill}\"")]
    #[diagnostic(
        code(colonel::skill::duplicate_action),
        help("Action names must be unique within a skill. Rename or remove one of them.")
    )]
    DuplicateAction { skill: String, action: String },

    #[error("duplicate skill \"{skill}\" (also defined in {first_origin})")]
    #[diagnostic(
        code(colonel::skill::duplicate_skill),
        help("Skill names must be unique across all loaded sources.")
    )]
    DuplicateSkill { skill: String, first_origin: String },

    #[error("unknown parameter type \"{ty}\" for {skill}.{action}.{param}")]
    #[diagnostic(
        code(colonel::skill::unknown_param_type),
        help("Supported types: string, integer, number, boolean, array, object.")
    )]
    UnknownParamType {
        skill: String,
        action: String,
        param: String,
        ty: String,
    },

    #[error("unknown category \"{category}\" for {skill}.{action}")]
    #[diagnostic(
        code(colonel::skill::unknown_category),
        help("An action's category must be `read` or `write`.")
    )]
    UnknownCategory {
        skill: String,
        action: String,
        category: String,
    },

    #[error("invalid default for {skill}.{action}.{param}: expected {expected}")]
    #[diagnostic(
        code(colonel::skill::invalid_default),
        help("A parameter default must have the parameter's declared type and appear in its enum, if any.")
    )]
    InvalidDefault {
        skill: String,
        action: String,
        param: String,
        expected: String,
    },

    #[error("action {skill}.{action} has no capability bound")]
    #[diagnostic(
        code(colonel::skill::unbound),
        help(
            "Declare an `exec` block in the skill definition, or bind a capability \
             for this action with `CapabilityBindings::bind` before loading."
        )
    )]
    Unbound { skill: String, action: String },

    #[error("unsafe exec block for {skill}.{action}: {message}")]
    #[diagnostic(
        code(colonel::skill::unsafe_exec),
        help(
            "Placeholders are only allowed in `args` or in the `shell` script, and a \
             shell placeholder must stand outside quotes: its value is quoted for you."
        )
    )]
    UnsafeExec {
        skill: String,
        action: String,
        message: String,
    },
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config: {path}")]
    #[diagnostic(
        code(colonel::config::read),
        help("Ensure the config file exists and is readable, or run `colonel config init`.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {path}: {message}")]
    #[diagnostic(
        code(colonel::config::parse),
        help("Check the TOML syntax in the config file.")
    )]
    Parse { path: String, message: String },

    #[error("failed to write config: {path}")]
    #[diagnostic(
        code(colonel::config::write),
        help("Ensure you have write permissions to the target directory.")
    )]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid pattern in [{section}]: {pattern}: {message}")]
    #[diagnostic(
        code(colonel::config::pattern),
        help("Configured patterns are Rust regular expressions (blocklist, confirmation) or globs (models).")
    )]
    InvalidPattern {
        section: String,
        pattern: String,
        message: String,
    },

    #[error("default model \"{model}\" is not in [[models.profiles]]")]
    #[diagnostic(
        code(colonel::config::default_model),
        help("Set `models.default` to the id of one of the configured profiles.")
    )]
    UnknownDefaultModel { model: String },
}

// ---------------------------------------------------------------------------
// Session store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("session store I/O failed at {path}")]
    #[diagnostic(
        code(colonel::store::io),
        help("Ensure the session directory exists and is writable.")
    )]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt session record {session_id}: {message}")]
    #[diagnostic(
        code(colonel::store::corrupt),
        help("The stored record could not be decoded. Delete it to start over.")
    )]
    Corrupt { session_id: String, message: String },

    #[error("session {session_id} not found")]
    #[diagnostic(code(colonel::store::not_found))]
    NotFound { session_id: String },
}

// ---------------------------------------------------------------------------
// Session errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum SessionError {
    #[error("session {session_id} is closed")]
    #[diagnostic(
        code(colonel::session::closed),
        help("Start a new session with a `new_session` frame or a fresh connection.")
    )]
    Closed { session_id: String },

    #[error("unknown model \"{model_id}\"")]
    #[diagnostic(
        code(colonel::session::unknown_model),
        help("Pick one of the models listed by `GET /api/models`.")
    )]
    UnknownModel { model_id: String },

    #[error("malformed frame: {message}")]
    #[diagnostic(
        code(colonel::session::frame),
        help("Frames are JSON objects with a `type` field, e.g. {{\"type\":\"user_message\",\"text\":\"hi\"}}.")
    )]
    MalformedFrame { message: String },
}

/// Convenience alias for colonel operations.
pub type ColonelResult<T> = std::result::Result<T, ColonelError>;
