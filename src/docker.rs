//! OCI image pre-pull via the docker CLI.
//!
//! Pots may reference a remote image in `pot.yml`; the loader pulls it at
//! install time and retags it into the local `potstack/<owner>/<name>`
//! namespace so the sandbox can use it without network access.

use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::constants::DOCKER_TIMEOUT;
use crate::error::{Error, Result};

/// Pulls `remote_image` and tags it as `local_tag`.
pub async fn pull_and_tag(remote_image: &str, local_tag: &str) -> Result<()> {
    run_docker(&["pull", remote_image]).await?;
    run_docker(&["tag", remote_image, local_tag]).await?;
    debug!(image = remote_image, tag = local_tag, "image pulled and tagged");
    Ok(())
}

/// Removes a local tag. Best effort.
pub async fn remove_tag(local_tag: &str) -> Result<()> {
    run_docker(&["rmi", local_tag]).await
}

/// True if the tag exists locally.
pub async fn image_exists(tag: &str) -> bool {
    run_docker(&["image", "inspect", tag]).await.is_ok()
}

/// Local tag for a pot's pre-pulled image.
pub fn local_tag(owner: &str, name: &str) -> String {
    format!("potstack/{owner}/{name}:latest")
}

async fn run_docker(args: &[&str]) -> Result<()> {
    let output = tokio::time::timeout(
        DOCKER_TIMEOUT,
        Command::new("docker")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output(),
    )
    .await
    .map_err(|_| Error::ToolFailed {
        tool: "docker".to_string(),
        reason: format!("timed out after {DOCKER_TIMEOUT:?}"),
    })?
    .map_err(|e| Error::ToolFailed {
        tool: "docker".to_string(),
        reason: e.to_string(),
    })?;

    if !output.status.success() {
        return Err(Error::ToolFailed {
            tool: "docker".to_string(),
            reason: format!(
                "docker {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(())
}
