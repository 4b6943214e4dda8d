//! System prompt assembly.

use crate::model::ModelProfile;
use crate::skills::Registry;

const PREAMBLE: &str = "\
You are The Colonel, an operations assistant with access to infrastructure skills. \
Use a skill only when the user's request needs live data or a change. \
Call at most one skill at a time and wait for its result before continuing. \
Never attempt to work around a denied or rejected action.";

/// Build the system prompt for `model` from the current registry.
pub fn system_prompt(registry: &Registry, model: &ModelProfile) -> String {
    let mode = if model.write_capable {
        "You may propose read and write actions. Write actions and actions marked \
         (requires confirmation) run only after the user approves them."
    } else {
        "You are running as a read-only model. Write actions will be denied; \
         propose only read actions and tell the user when a change needs a \
         write-capable model."
    };
    format!(
        "{PREAMBLE}\n\nActive model: {model}\n{mode}\n\n## Available skills\n\n{}",
        registry.describe()
    )
}
