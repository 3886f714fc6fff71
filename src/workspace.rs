//! Project directories on the host, bind-mounted into sandboxes.

use crate::error::{Result, SandboxError};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::info;

const GITHUB_PREFIX: &str = "https://github.com/";

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `~/.codeblocking/workspaces`, or `./workspaces` without a home directory.
    pub fn default_root() -> PathBuf {
        dirs::home_dir()
            .map(|home| home.join(".codeblocking").join("workspaces"))
            .unwrap_or_else(|| PathBuf::from("workspaces"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the workspace root and check that it is a writable directory.
    pub async fn initialize(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let metadata = tokio::fs::metadata(&self.root).await?;
        if metadata.permissions().readonly() {
            return Err(SandboxError::Workspace(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("{} is read-only", self.root.display()),
            )));
        }
        info!(root = %self.root.display(), "Workspace initialized");
        Ok(())
    }

    /// `{root}/{user_id}/{project_id}`. Ids must be single, plain path
    /// components.
    pub fn project_path(&self, user_id: &str, project_id: &str) -> Result<PathBuf> {
        if !is_plain_component(user_id) {
            return Err(SandboxError::InvalidUserId(user_id.to_string()));
        }
        if !is_plain_component(project_id) {
            return Err(SandboxError::InvalidProjectId(project_id.to_string()));
        }
        Ok(self.root.join(user_id).join(project_id))
    }

    pub async fn ensure_project_dir(&self, path: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(path).await?;
        Ok(tokio::fs::canonicalize(path).await?)
    }

    /// Clone `repo_url` into `path`. A token, when given, is embedded in
    /// GitHub HTTPS URLs so private repositories can be fetched.
    pub async fn clone_repo(&self, path: &Path, repo_url: &str, token: Option<&str>) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let url = authenticated_url(repo_url, token);
        let output = Command::new("git")
            .arg("clone")
            .arg("--")
            .arg(&url)
            .arg(path)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = match token {
                Some(t) if !t.is_empty() => stderr.replace(t, "***"),
                _ => stderr.into_owned(),
            };
            return Err(SandboxError::Git(stderr.trim().to_string()));
        }

        info!(repo = %repo_url, path = %path.display(), "Repository cloned");
        Ok(())
    }

    /// Remove a project tree. Missing directories are fine.
    pub async fn delete_tree(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {
                info!(path = %path.display(), "Project deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn is_plain_component(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
}

fn authenticated_url(repo_url: &str, token: Option<&str>) -> String {
    match (token, repo_url.strip_prefix(GITHUB_PREFIX)) {
        (Some(token), Some(rest)) if !token.is_empty() => {
            format!("https://{}@github.com/{}", token, rest)
        }
        _ => repo_url.to_string(),
    }
}
