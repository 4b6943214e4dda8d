//! Capability callables: the code that performs an action's real side effect.
//!
//! Every [`ActionDescriptor`](super::ActionDescriptor) is bound to exactly one
//! [`Capability`] when the registry is loaded. Bindings come from two places:
//!
//! - the host, through [`CapabilityBindings`] (database clients, container
//!   runtime clients, anything in-process);
//! - the definition itself, through an `exec` block, which resolves to a
//!   [`ProcessCapability`] that spawns a program directly or runs a
//!   `/bin/sh -c` script. Parameter values only ever land in argument
//!   positions: argv placeholders become whole arguments, shell placeholders
//!   are single-quoted.
//!
//! Capabilities receive a [`CancellationToken`]. Honouring it is best effort;
//! process capabilities kill the child when it fires.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::ops::Range;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::ValidatedParams;

// ── Errors ───────────────────────────────────────────────────────────────

/// Failures raised by a capability callable.
#[derive(Debug, Error, Diagnostic)]
pub enum CapabilityError {
    #[error("{message}")]
    #[diagnostic(
        code(colonel::capability::failed),
        help("The underlying operation reported an error. Inspect its output for details.")
    )]
    Failed { message: String },

    #[error("capability unavailable: {message}")]
    #[diagnostic(
        code(colonel::capability::unavailable),
        help("The downstream system (database, container runtime, binary) could not be reached.")
    )]
    Unavailable { message: String },

    #[error("cancelled")]
    #[diagnostic(code(colonel::capability::cancelled))]
    Cancelled,
}

impl CapabilityError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

// ── Capability trait ─────────────────────────────────────────────────────

/// The side-effecting half of an action.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Perform the action once. Returns raw output text.
    async fn invoke(
        &self,
        params: &ValidatedParams,
        cancel: CancellationToken,
    ) -> Result<String, CapabilityError>;

    /// Short label for listings and debug output.
    fn describe(&self) -> String {
        "host capability".into()
    }
}

type BoxedFn =
    dyn Fn(ValidatedParams, CancellationToken) -> BoxFuture<'static, Result<String, CapabilityError>>
        + Send
        + Sync;

/// Adapts an async closure into a [`Capability`].
pub struct FnCapability {
    label: String,
    f: Box<BoxedFn>,
}

impl FnCapability {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(ValidatedParams, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, CapabilityError>> + Send + 'static,
    {
        Self {
            label: "host closure".into(),
            f: Box::new(move |params, cancel| f(params, cancel).boxed()),
        }
    }

    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

#[async_trait]
impl Capability for FnCapability {
    async fn invoke(
        &self,
        params: &ValidatedParams,
        cancel: CancellationToken,
    ) -> Result<String, CapabilityError> {
        (self.f)(params.clone(), cancel).await
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

// ── Bindings ─────────────────────────────────────────────────────────────

/// Host-supplied capabilities keyed by `(skill, action)`.
#[derive(Clone, Default)]
pub struct CapabilityBindings {
    bound: HashMap<(String, String), Arc<dyn Capability>>,
}

impl CapabilityBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style binding. A later binding for the same action replaces
    /// the earlier one.
    pub fn bind(
        mut self,
        skill: impl Into<String>,
        action: impl Into<String>,
        capability: Arc<dyn Capability>,
    ) -> Self {
        self.insert(skill, action, capability);
        self
    }

    pub fn insert(
        &mut self,
        skill: impl Into<String>,
        action: impl Into<String>,
        capability: Arc<dyn Capability>,
    ) {
        self.bound.insert((skill.into(), action.into()), capability);
    }

    pub fn get(&self, skill: &str, action: &str) -> Option<Arc<dyn Capability>> {
        self.bound
            .get(&(skill.to_string(), action.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.bound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bound.is_empty()
    }
}

impl fmt::Debug for CapabilityBindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self
            .bound
            .keys()
            .map(|(s, a)| format!("{s}.{a}"))
            .collect();
        keys.sort();
        f.debug_struct("CapabilityBindings")
            .field("bound", &keys)
            .finish()
    }
}

// ── Process capability ───────────────────────────────────────────────────

/// Declarative process invocation from a skill definition's `exec` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExecSpec {
    /// Spawn `program` directly with templated arguments. No shell involved.
    Argv {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Run a templated script through `/bin/sh -c`.
    Shell { shell: String },
}

impl ExecSpec {
    /// Reject templates where a parameter value could become part of the
    /// command rather than an argument to it.
    pub fn check(&self) -> Result<(), String> {
        match self {
            Self::Argv { program, .. } => match placeholders(program).first() {
                Some((_, name)) => Err(format!("program contains placeholder {{{name}}}")),
                None => Ok(()),
            },
            Self::Shell { shell } => check_shell_template(shell),
        }
    }
}

/// Runs an [`ExecSpec`] with `{param}` placeholders filled from the
/// validated parameters.
#[derive(Debug, Clone)]
pub struct ProcessCapability {
    spec: ExecSpec,
}

impl ProcessCapability {
    pub fn new(spec: ExecSpec) -> Self {
        Self { spec }
    }

    /// Program and argument vector after placeholder substitution.
    ///
    /// In argv mode an argument that consisted only of placeholders and
    /// rendered empty is dropped, so optional flags can be omitted. The
    /// program is used as written.
    pub fn render(&self, params: &ValidatedParams) -> (String, Vec<String>) {
        match &self.spec {
            ExecSpec::Argv { program, args } => {
                let rendered = args
                    .iter()
                    .filter_map(|arg| {
                        let out = substitute(arg, |name| params.render(name));
                        (!out.is_empty() || !only_placeholders(arg)).then_some(out)
                    })
                    .collect();
                (program.clone(), rendered)
            }
            ExecSpec::Shell { shell } => {
                let script = substitute(shell, |name| {
                    shell_words::quote(&params.render(name)).into_owned()
                });
                ("/bin/sh".into(), vec!["-c".into(), script])
            }
        }
    }
}

#[async_trait]
impl Capability for ProcessCapability {
    async fn invoke(
        &self,
        params: &ValidatedParams,
        cancel: CancellationToken,
    ) -> Result<String, CapabilityError> {
        let (program, args) = self.render(params);

        let child = tokio::process::Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CapabilityError::unavailable(format!("failed to spawn {program}: {e}")))?;

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            out = child.wait_with_output() => out
                .map_err(|e| CapabilityError::failed(format!("failed to wait on {program}: {e}")))?,
            _ = cancel.cancelled() => return Err(CapabilityError::Cancelled),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut text = String::new();
        if !stdout.is_empty() {
            text.push_str(&stdout);
        }
        if !stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str("[stderr]\n");
            text.push_str(&stderr);
        }

        if output.status.success() {
            Ok(text)
        } else {
            let code = output.status.code().unwrap_or(-1);
            Err(CapabilityError::failed(format!("exit code {code}\n{text}")))
        }
    }

    fn describe(&self) -> String {
        match &self.spec {
            ExecSpec::Argv { program, .. } => format!("exec {program}"),
            ExecSpec::Shell { .. } => "exec /bin/sh -c".into(),
        }
    }
}

/// Byte ranges of the `{name}` placeholders in `template`, with their
/// names. Braces that do not close a valid identifier are not placeholders.
fn placeholders(template: &str) -> Vec<(Range<usize>, &str)> {
    let mut found = Vec::new();
    let mut pos = 0;
    while let Some(open) = template[pos..].find('{') {
        let start = pos + open;
        let after = &template[start + 1..];
        match after.find('}') {
            Some(close) if is_placeholder_name(&after[..close]) => {
                let end = start + close + 2;
                found.push((start..end, &after[..close]));
                pos = end;
            }
            _ => pos = start + 1,
        }
    }
    found
}

/// Replace every placeholder with `render(name)`.
fn substitute(template: &str, render: impl Fn(&str) -> String) -> String {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for (span, name) in placeholders(template) {
        out.push_str(&template[last..span.start]);
        out.push_str(&render(name));
        last = span.end;
    }
    out.push_str(&template[last..]);
    out
}

/// Shell placeholders must sit outside quotes and escapes, and must not
/// follow `$`. Inside quotes the quoted value would close the surrounding
/// quote and leave its content to the shell.
fn check_shell_template(script: &str) -> Result<(), String> {
    let spans = placeholders(script);
    let mut pending = spans.iter().peekable();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut prev = None;

    for (i, c) in script.char_indices() {
        if let Some((span, name)) = pending.peek() {
            if span.start == i {
                if quote.is_some() || escaped {
                    return Err(format!("placeholder {{{name}}} is inside quotes"));
                }
                if prev == Some('$') {
                    return Err(format!("placeholder {{{name}}} follows `$`"));
                }
                pending.next();
            }
        }
        prev = Some(c);
        if escaped {
            escaped = false;
            continue;
        }
        match (quote, c) {
            (None, '\\') | (Some('"'), '\\') => escaped = true,
            (None, '\'' | '"') => quote = Some(c),
            (Some(q), _) if q == c => quote = None,
            _ => {}
        }
    }
    Ok(())
}

fn is_placeholder_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn only_placeholders(template: &str) -> bool {
    let mut rest = template;
    loop {
        if rest.is_empty() {
            return true;
        }
        let Some(inner) = rest.strip_prefix('{') else {
            return false;
        };
        match inner.find('}') {
            Some(close) if is_placeholder_name(&inner[..close]) => rest = &inner[close + 1..],
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn params(pairs: &[(&str, serde_json::Value)]) -> ValidatedParams {
        let map: BTreeMap<String, serde_json::Value> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        ValidatedParams::new(map)
    }

    #[test]
    fn substitute_fills_known_placeholders() {
        let p = params(&[("container", "web".into()), ("lines", 50.into())]);
        let render = |name: &str| p.render(name);
        assert_eq!(
            substitute("logs --tail {lines} {container}", render),
            "logs --tail 50 web"
        );
        assert_eq!(substitute("json {\"a\": 1}", render), "json {\"a\": 1}");
        assert_eq!(substitute("{{.Names}}\t{container}", render), "{{.Names}}\tweb");
        assert_eq!(substitute("{missing}", render), "");
    }

    #[test]
    fn argv_render_drops_empty_optional_args() {
        let cap = ProcessCapability::new(ExecSpec::Argv {
            program: "docker".into(),
            args: vec!["logs".into(), "{since}".into(), "{container}".into()],
        });
        let (program, args) = cap.render(&params(&[("container", "web".into())]));
        assert_eq!(program, "docker");
        assert_eq!(args, vec!["logs", "web"]);
    }

    #[test]
    fn shell_render_wraps_script() {
        let cap = ProcessCapability::new(ExecSpec::Shell {
            shell: "echo {msg}".into(),
        });
        let (program, args) = cap.render(&params(&[("msg", "hi".into())]));
        assert_eq!(program, "/bin/sh");
        assert_eq!(args, vec!["-c", "echo hi"]);

        let (_, args) = cap.render(&params(&[("msg", "hi; touch /tmp/x".into())]));
        assert_eq!(args, vec!["-c", "echo 'hi; touch /tmp/x'"]);
    }

    #[test]
    fn argv_program_is_never_templated() {
        let cap = ProcessCapability::new(ExecSpec::Argv {
            program: "{tool}".into(),
            args: vec![],
        });
        let (program, _) = cap.render(&params(&[("tool", "rm".into())]));
        assert_eq!(program, "{tool}");
    }

    #[test]
    fn exec_templates_are_checked() {
        let ok = |spec: ExecSpec| spec.check().is_ok();
        assert!(ok(ExecSpec::Shell { shell: "echo {msg} | wc -c".into() }));
        assert!(ok(ExecSpec::Shell { shell: "echo '{literal' {msg}".into() }));
        assert!(ok(ExecSpec::Argv { program: "docker".into(), args: vec!["{container}".into()] }));

        assert!(!ok(ExecSpec::Argv { program: "{tool}".into(), args: vec![] }));
        assert!(!ok(ExecSpec::Shell { shell: "echo '{msg}'".into() }));
        assert!(!ok(ExecSpec::Shell { shell: "echo \"x {msg}\"".into() }));
        assert!(!ok(ExecSpec::Shell { shell: "echo \\{msg}".into() }));
        assert!(!ok(ExecSpec::Shell { shell: "echo ${msg}".into() }));
    }

    #[test]
    fn exec_spec_deserializes_both_forms() {
        let argv: ExecSpec =
            serde_json::from_str(r#"{"program":"ls","args":["-l"]}"#).unwrap();
        assert!(matches!(argv, ExecSpec::Argv { .. }));
        let shell: ExecSpec = serde_json::from_str(r#"{"shell":"uptime"}"#).unwrap();
        assert!(matches!(shell, ExecSpec::Shell { .. }));
    }

    #[tokio::test]
    async fn process_capability_captures_stdout() {
        let cap = ProcessCapability::new(ExecSpec::Shell {
            shell: "echo {msg}".into(),
        });
        let out = cap
            .invoke(&params(&[("msg", "hello".into())]), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn shell_values_cannot_run_commands() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("marker");
        let cap = ProcessCapability::new(ExecSpec::Shell {
            shell: "echo {msg}".into(),
        });
        for payload in [
            format!("hi; touch {}", marker.display()),
            format!("$(touch {})", marker.display()),
            format!("`touch {}`", marker.display()),
            format!("x' ; touch {} ; echo '", marker.display()),
        ] {
            let out = cap
                .invoke(&params(&[("msg", payload.clone().into())]), CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(out.trim_end(), payload);
            assert!(!marker.exists(), "{payload}");
        }
    }

    #[tokio::test]
    async fn process_capability_reports_exit_code() {
        let cap = ProcessCapability::new(ExecSpec::Shell {
            shell: "echo oops >&2; exit 3".into(),
        });
        let err = cap
            .invoke(&params(&[]), CancellationToken::new())
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exit code 3"));
        assert!(msg.contains("oops"));
    }

    #[tokio::test]
    async fn process_capability_honours_cancel() {
        let cap = ProcessCapability::new(ExecSpec::Shell {
            shell: "sleep 5".into(),
        });
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = cap.invoke(&params(&[]), cancel).await.unwrap_err();
        assert!(matches!(err, CapabilityError::Cancelled));
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let cap = ProcessCapability::new(ExecSpec::Argv {
            program: "/nonexistent/colonel-test-binary".into(),
            args: vec![],
        });
        let err = cap
            .invoke(&params(&[]), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CapabilityError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn fn_capability_sees_params() {
        let cap = FnCapability::new(|p: ValidatedParams, _cancel| async move {
            Ok(format!("got {}", p.render("x")))
        });
        let out = cap
            .invoke(&params(&[("x", "1".into())]), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, "got 1");
    }

    #[test]
    fn bindings_lookup() {
        let cap: Arc<dyn Capability> =
            Arc::new(FnCapability::new(|_p, _c| async { Ok(String::new()) }));
        let b = CapabilityBindings::new().bind("postgres", "query", cap);
        assert!(b.get("postgres", "query").is_some());
        assert!(b.get("postgres", "drop").is_none());
        assert_eq!(b.len(), 1);
    }
}
