// src/core/shell.rs

//! Runs operator-configured shell commands with a bounded execution time.
//!
//! Templates reference runtime values through `{name}` placeholders. A
//! placeholder is rendered as a quoted reference to the environment variable
//! `FAILOVERD_<NAME>`, and the value itself is only ever passed through the
//! child's environment. Values never become part of the script text, so they
//! cannot inject commands and do not show up in logs or error messages.
//! Placeholders must therefore not be quoted inside the template.

use crate::core::errors::ClusterError;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Prefix of the environment variables that carry placeholder values.
const ENV_PREFIX: &str = "FAILOVERD_";

/// The environment variable holding the value of placeholder `name`.
pub fn env_var(name: &str) -> String {
    format!("{ENV_PREFIX}{}", name.to_ascii_uppercase())
}

/// Replaces every `{name}` placeholder in `template` with a quoted reference
/// to its environment variable.
pub fn render(template: &str, names: &[&str]) -> String {
    names.iter().fold(template.to_string(), |acc, name| {
        acc.replace(&format!("{{{name}}}"), &format!("\"${{{}}}\"", env_var(name)))
    })
}

/// Runs `command` through `sh -c`, returning its trimmed stdout.
/// A non-zero exit status or a timeout is reported as `ClusterError::Command`.
pub async fn run(command: &str, timeout: Duration) -> Result<String, ClusterError> {
    run_template(command, &[], timeout).await
}

/// Renders `template` and runs it with each `(name, value)` bound in the
/// child's environment.
pub async fn run_template(
    template: &str,
    vars: &[(&str, &str)],
    timeout: Duration,
) -> Result<String, ClusterError> {
    let names: Vec<&str> = vars.iter().map(|(name, _)| *name).collect();
    let script = render(template, &names);
    debug!("Running command: {}", script);

    let mut command = Command::new("sh");
    command.arg("-c").arg(&script).kill_on_drop(true);
    for (name, value) in vars {
        command.env(env_var(name), value);
    }

    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| ClusterError::Command(format!("'{script}' timed out after {timeout:?}")))??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ClusterError::Command(format!(
            "'{script}' exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
