use anyhow::{Context, Result};
use std::process::{Command, Stdio};

/// Checks if the current directory is inside a Git work tree.
pub fn is_inside_work_tree() -> Result<bool> {
    let status = Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(exit) => Ok(exit.success()),
        Err(_) => Ok(false),
    }
}

/// Executes a git command and returns stdout as a string.
pub fn run_git_command(args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .output()
        .context("Failed to execute git command")?;

    if !output.status.success() {
        return Err(anyhow::anyhow!(
            "Git command failed: {}",
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    let stdout =
        String::from_utf8(output.stdout).context("Invalid UTF-8 output from git command")?;

    Ok(stdout.trim().to_string())
}

/// Get the root directory of the current git repository.
pub fn get_repo_root() -> Result<std::path::PathBuf> {
    if !is_inside_work_tree()? {
        return Err(anyhow::anyhow!(
            "Not in a Git repository. Please run this command from within a Git repository."
        ));
    }
    let root = run_git_command(&["rev-parse", "--show-toplevel"])?;
    Ok(std::path::PathBuf::from(root))
}
