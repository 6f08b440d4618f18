//! Sandbox lifecycle collaborator.
//!
//! A session must not start unless its execution environment is up; the
//! manager requests that guarantee through [`SandboxLifecycle`] before every
//! spawn or recovery restart. Two implementations:
//!
//! - [`HostSandbox`]: the agent runs directly on the host (development).
//! - [`ContainerSandbox`]: the agent runs inside a long-lived container
//!   managed via the Docker or Podman CLI; the agent invocation is wrapped
//!   with `exec -i` so stdio framing is identical in both modes.

mod error;

pub use error::{SandboxError, SandboxResult};

use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::session::AgentCommand;

/// Guarantee provider for the agent's execution environment.
#[async_trait]
pub trait SandboxLifecycle: Send + Sync {
    /// Ensure the target environment is running; called before every session
    /// start. An error aborts session creation as a recoverable failure.
    async fn ensure_running(&self) -> SandboxResult<()>;

    /// Rewrite the agent invocation to run inside the environment.
    fn wrap_command(&self, agent: &AgentCommand) -> AgentCommand;
}

/// No isolation: the agent subprocess runs directly on the host.
#[derive(Debug, Default)]
pub struct HostSandbox;

#[async_trait]
impl SandboxLifecycle for HostSandbox {
    async fn ensure_running(&self) -> SandboxResult<()> {
        Ok(())
    }

    fn wrap_command(&self, agent: &AgentCommand) -> AgentCommand {
        agent.clone()
    }
}

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Docker runtime (default for macOS/Windows dev)
    Docker,
    /// Podman runtime (default for Linux prod)
    #[default]
    Podman,
}

impl RuntimeKind {
    /// Get the default binary name for this runtime.
    pub fn binary(&self) -> &'static str {
        match self {
            RuntimeKind::Docker => "docker",
            RuntimeKind::Podman => "podman",
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeKind::Docker => write!(f, "docker"),
            RuntimeKind::Podman => write!(f, "podman"),
        }
    }
}

/// Validate a container name or image reference.
///
/// Names are alphanumeric with `-`, `_`, `.`; image references additionally
/// allow `/` and `:`.
fn validate_name(name: &str, allow_image_chars: bool) -> SandboxResult<()> {
    if name.is_empty() {
        return Err(SandboxError::InvalidInput(
            "container name cannot be empty".to_string(),
        ));
    }
    if name.len() > 128 {
        return Err(SandboxError::InvalidInput(
            "container name exceeds maximum length".to_string(),
        ));
    }
    let valid = |c: char| {
        c.is_ascii_alphanumeric()
            || c == '-'
            || c == '_'
            || c == '.'
            || (allow_image_chars && (c == '/' || c == ':' || c == '@'))
    };
    if !name.chars().all(valid) {
        return Err(SandboxError::InvalidInput(format!(
            "'{name}' contains invalid characters"
        )));
    }
    Ok(())
}

/// One long-lived container the agent runs inside.
///
/// `ensure_running` creates the container from the configured image the first
/// time, restarts it when stopped, and is a no-op when it is already up.
#[derive(Debug, Clone)]
pub struct ContainerSandbox {
    runtime: RuntimeKind,
    container: String,
    image: String,
}

impl ContainerSandbox {
    pub fn new(
        runtime: RuntimeKind,
        container: impl Into<String>,
        image: impl Into<String>,
    ) -> SandboxResult<Self> {
        let container = container.into();
        let image = image.into();
        validate_name(&container, false)?;
        validate_name(&image, true)?;
        Ok(Self {
            runtime,
            container,
            image,
        })
    }

    /// Auto-detect an available runtime, preferring the given kind.
    pub async fn detect(
        preferred: Option<RuntimeKind>,
        container: impl Into<String>,
        image: impl Into<String>,
    ) -> SandboxResult<Self> {
        let candidates = match preferred {
            Some(kind) => vec![kind],
            None => vec![RuntimeKind::Podman, RuntimeKind::Docker],
        };
        for kind in candidates {
            if runtime_available(kind).await {
                debug!("using container runtime {kind}");
                return Self::new(kind, container, image);
            }
        }
        Err(SandboxError::NoRuntimeAvailable)
    }

    pub fn runtime(&self) -> RuntimeKind {
        self.runtime
    }

    pub fn container_name(&self) -> &str {
        &self.container
    }

    /// Run one runtime CLI command, capturing stdout.
    async fn run(&self, args: &[&str]) -> SandboxResult<String> {
        let output = Command::new(self.runtime.binary())
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(SandboxError::CommandFailed {
                command: args.first().copied().unwrap_or("?").to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    /// Inspect the container's state; `None` when it does not exist.
    async fn state(&self) -> SandboxResult<Option<String>> {
        match self
            .run(&["inspect", "-f", "{{.State.Status}}", &self.container])
            .await
        {
            Ok(status) => Ok(Some(status)),
            Err(SandboxError::CommandFailed { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl SandboxLifecycle for ContainerSandbox {
    async fn ensure_running(&self) -> SandboxResult<()> {
        match self.state().await? {
            Some(status) if status == "running" => {
                debug!("container {} already running", self.container);
                Ok(())
            }
            Some(status) => {
                info!(
                    "container {} is {status}, starting it",
                    self.container
                );
                self.run(&["start", &self.container]).await?;
                Ok(())
            }
            None => {
                info!(
                    "creating container {} from image {}",
                    self.container, self.image
                );
                self.run(&[
                    "run",
                    "-d",
                    "--name",
                    &self.container,
                    &self.image,
                    "sleep",
                    "infinity",
                ])
                .await?;
                Ok(())
            }
        }
    }

    fn wrap_command(&self, agent: &AgentCommand) -> AgentCommand {
        let mut args = vec!["exec".to_string(), "-i".to_string()];
        if let Some(ref dir) = agent.cwd {
            args.push("-w".to_string());
            args.push(dir.to_string_lossy().into_owned());
        }
        for (key, value) in &agent.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(self.container.clone());
        args.push(agent.program.clone());
        args.extend(agent.args.iter().cloned());

        AgentCommand::new(self.runtime.binary()).with_args(args)
    }
}

/// Check whether a runtime binary responds to `--version`.
async fn runtime_available(kind: RuntimeKind) -> bool {
    Command::new(kind.binary())
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_names_are_validated() {
        assert!(ContainerSandbox::new(RuntimeKind::Docker, "ottr-agent", "img").is_ok());
        assert!(ContainerSandbox::new(RuntimeKind::Docker, "", "img").is_err());
        assert!(ContainerSandbox::new(RuntimeKind::Docker, "bad name", "img").is_err());
        assert!(ContainerSandbox::new(RuntimeKind::Docker, "ok", "registry/img:tag").is_ok());
        assert!(ContainerSandbox::new(RuntimeKind::Docker, "ok", "img; rm -rf /").is_err());
    }

    #[test]
    fn wrap_command_execs_inside_the_container() {
        let sandbox = ContainerSandbox::new(RuntimeKind::Docker, "ottr-agent", "img").unwrap();
        let agent = AgentCommand::new("claude").with_args(["-p", "--verbose"]);
        let wrapped = sandbox.wrap_command(&agent);
        assert_eq!(wrapped.program, "docker");
        assert_eq!(
            wrapped.args,
            vec!["exec", "-i", "ottr-agent", "claude", "-p", "--verbose"]
        );
    }

    #[test]
    fn wrap_command_carries_workdir_and_env() {
        let sandbox = ContainerSandbox::new(RuntimeKind::Podman, "ottr-agent", "img").unwrap();
        let mut agent = AgentCommand::new("claude");
        agent.cwd = Some("/workspace".into());
        agent.env.insert("FOO".to_string(), "bar".to_string());
        let wrapped = sandbox.wrap_command(&agent);
        assert_eq!(wrapped.program, "podman");
        assert!(wrapped.args.windows(2).any(|w| w == ["-w", "/workspace"]));
        assert!(wrapped.args.windows(2).any(|w| w == ["-e", "FOO=bar"]));
    }

    #[tokio::test]
    async fn host_sandbox_is_a_noop() {
        let sandbox = HostSandbox;
        sandbox.ensure_running().await.unwrap();
        let agent = AgentCommand::new("claude");
        assert_eq!(sandbox.wrap_command(&agent).program, "claude");
    }
}
