//! The `exec` provider: a configuration-management hook.
//!
//! An `exec` resource runs a command (for example a playbook run) once its
//! inputs are known. It is ordered and failure-contained like any other
//! resource: the command only runs after the resources it references have
//! been committed, and their values reach it through `env`.
//!
//! ```yaml
//! - type: exec
//!   name: hana_disks
//!   attributes:
//!     command: ["ansible-playbook", "-i", "${local_file.inventory.filename}", "hana.yml"]
//!     env: { HANA_SID: "HN1" }
//!     working_dir: ./playbooks
//! ```

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::ResourceId;
use crate::error::ProviderError;
use crate::planner::{ActionKind, ChangeAction};
use crate::state::ResourceState;

use super::{string_list, Provider};

const COMMAND: &str = "command";
const DESTROY_COMMAND: &str = "destroy_command";
const ENV: &str = "env";
const WORKING_DIR: &str = "working_dir";

/// Longest stdout tail kept in state.
const MAX_OUTPUT: usize = 4096;

/// Provider for `exec` resources.
#[derive(Debug, Default)]
pub struct ExecProvider;

/// Captured result of a finished command.
struct CommandOutput {
    exit_code: i32,
    stdout: String,
}

impl ExecProvider {
    /// Creates the provider.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    async fn run(
        id: &ResourceId,
        argv: &[String],
        attributes: &BTreeMap<String, Value>,
    ) -> Result<CommandOutput, ProviderError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(ProviderError::invalid_attribute(id, COMMAND, "must not be empty"));
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(env) = attributes.get(ENV) {
            let env = env
                .as_object()
                .ok_or_else(|| ProviderError::invalid_attribute(id, ENV, "expected a map"))?;
            for (name, value) in env {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                command.env(name, value);
            }
        }

        if let Some(dir) = attributes.get(WORKING_DIR) {
            let dir = dir
                .as_str()
                .ok_or_else(|| ProviderError::invalid_attribute(id, WORKING_DIR, "expected a string"))?;
            command.current_dir(dir);
        }

        info!("{id}: running {}", argv.join(" "));
        let output = command
            .output()
            .await
            .map_err(|e| ProviderError::failed(id, format!("Failed to start {program}: {e}")))?;

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = tail(&String::from_utf8_lossy(&output.stdout));
        debug!("{id}: exited with {exit_code}");

        if !output.status.success() {
            let stderr = tail(&String::from_utf8_lossy(&output.stderr));
            return Err(ProviderError::failed(
                id,
                format!("{program} exited with {exit_code}: {}", stderr.trim()),
            ));
        }

        Ok(CommandOutput { exit_code, stdout })
    }
}

/// Keeps the last [`MAX_OUTPUT`] bytes, on a char boundary.
fn tail(text: &str) -> String {
    if text.len() <= MAX_OUTPUT {
        return text.to_string();
    }
    let mut start = text.len() - MAX_OUTPUT;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[async_trait]
impl Provider for ExecProvider {
    async fn apply(&self, action: &ChangeAction) -> Result<Option<ResourceState>, ProviderError> {
        if action.kind == ActionKind::Destroy {
            let Some(before) = &action.before else {
                return Ok(None);
            };
            if let Some(argv) = string_list(&action.id, &before.attributes, DESTROY_COMMAND)? {
                Self::run(&action.id, &argv, &before.attributes).await?;
            }
            return Ok(None);
        }

        let attributes = action
            .after
            .as_ref()
            .map(|d| d.attributes.clone())
            .unwrap_or_default();
        let argv = string_list(&action.id, &attributes, COMMAND)?
            .ok_or_else(|| ProviderError::invalid_attribute(&action.id, COMMAND, "is required"))?;

        let output = Self::run(&action.id, &argv, &attributes).await?;

        Ok(Some(ResourceState::new(
            action.id.clone(),
            attributes,
            BTreeMap::from([
                (String::from("exit_code"), json!(output.exit_code)),
                (String::from("stdout"), json!(output.stdout.trim_end())),
            ]),
        )))
    }

    async fn read(
        &self,
        id: &ResourceId,
        attributes: &BTreeMap<String, Value>,
    ) -> Result<ResourceState, ProviderError> {
        // A command leaves nothing observable behind.
        Ok(ResourceState::new(id.clone(), attributes.clone(), BTreeMap::new()))
    }

    // Every update runs the command again.
    fn keeps_computed_on_update(&self, _attribute: &str) -> bool {
        false
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::ResourceDefinition;
    use tempfile::TempDir;

    fn action(kind: ActionKind, definition: ResourceDefinition) -> ChangeAction {
        ChangeAction {
            kind,
            id: definition.id(),
            before: None,
            after: Some(definition),
            changes: Vec::new(),
            replacement: false,
        }
    }

    #[tokio::test]
    async fn test_runs_command_with_env() {
        let definition = ResourceDefinition::new("exec", "configure")
            .with_attribute(COMMAND, json!(["sh", "-c", "echo host=$HANA_HOST"]))
            .with_attribute(ENV, json!({"HANA_HOST": "10.0.0.4"}));

        let state = ExecProvider::new()
            .apply(&action(ActionKind::Create, definition))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(state.computed["exit_code"], json!(0));
        assert_eq!(state.computed_str("stdout"), Some("host=10.0.0.4"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails() {
        let definition = ResourceDefinition::new("exec", "configure")
            .with_attribute(COMMAND, json!(["sh", "-c", "echo boom >&2; exit 3"]));

        let err = ExecProvider::new()
            .apply(&action(ActionKind::Create, definition))
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("exited with 3"));
        assert!(message.contains("boom"));
    }

    #[tokio::test]
    async fn test_destroy_runs_destroy_command() {
        let temp = TempDir::new().unwrap();
        let marker = temp.path().join("destroyed");
        let definition = ResourceDefinition::new("exec", "configure")
            .with_attribute(COMMAND, json!(["true"]))
            .with_attribute(DESTROY_COMMAND, json!(["touch", marker.to_string_lossy()]));

        let provider = ExecProvider::new();
        let created = provider
            .apply(&action(ActionKind::Create, definition.clone()))
            .await
            .unwrap();

        let destroy = ChangeAction {
            kind: ActionKind::Destroy,
            before: created,
            after: None,
            ..action(ActionKind::Destroy, definition)
        };
        assert!(provider.apply(&destroy).await.unwrap().is_none());
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn test_missing_command() {
        let definition = ResourceDefinition::new("exec", "configure");
        let err = ExecProvider::new()
            .apply(&action(ActionKind::Create, definition))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidAttribute { .. }));
    }

    #[test]
    fn test_tail_keeps_end() {
        let long = "x".repeat(MAX_OUTPUT + 10) + "end";
        let kept = tail(&long);
        assert_eq!(kept.len(), MAX_OUTPUT);
        assert!(kept.ends_with("end"));
    }
}
