use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, bail};
use log::debug;

pub const TOOL_NAME: &str = "wdarchive";
pub const TOOL_EMAIL: &str = "wdarchive@localhost";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub name: String,
    pub email: String,
}

impl Signature {
    pub fn tool() -> Self {
        Self {
            name: TOOL_NAME.to_string(),
            email: TOOL_EMAIL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRequest {
    pub message: String,
    pub author: Signature,
    /// Epoch seconds, UTC. `None` uses the current time.
    pub timestamp: Option<i64>,
}

/// Untracked files `restore_head` is allowed to delete. Anything outside the
/// scope is left on disk.
#[derive(Debug, Clone, Copy)]
pub struct CleanScope<'a> {
    /// Files or whole directories, relative to the root.
    pub paths: &'a [&'a str],
    /// Extensions of non-hidden files directly under the root.
    pub root_extensions: &'a [&'a str],
}

impl CleanScope<'_> {
    pub fn contains(&self, path: &str) -> bool {
        if self
            .paths
            .iter()
            .any(|scoped| path == *scoped || path.starts_with(&format!("{scoped}/")))
        {
            return true;
        }
        if path.contains('/') || path.starts_with('.') {
            return false;
        }
        path.rsplit_once('.')
            .is_some_and(|(_, extension)| self.root_extensions.contains(&extension))
    }
}

/// Operations the archiver needs from the versioned target directory.
/// Paths are relative to `root()` and use `/` separators.
pub trait VersionStore {
    fn root(&self) -> &Path;
    fn has_commits(&self) -> Result<bool>;
    fn move_path(&mut self, from: &str, to: &str) -> Result<()>;
    fn stage(&mut self, paths: &[String]) -> Result<()>;
    /// Records everything staged as one commit and returns its identifier.
    fn commit(&mut self, request: &CommitRequest) -> Result<String>;
    /// File content at the head commit; `None` when absent or no head exists.
    fn read_committed(&self, path: &str) -> Result<Option<String>>;
    /// Resets tracked files to the head commit and deletes the untracked
    /// files inside `scope`. Uncommitted edits to tracked files are lost.
    fn restore_head(&mut self, scope: &CleanScope<'_>) -> Result<()>;
}

/// Drives the `git` command-line tool in a working directory.
#[derive(Debug, Clone)]
pub struct GitRepository {
    root: PathBuf,
}

impl GitRepository {
    /// Opens `root` as a repository, initialising one when absent.
    /// Returns whether a new repository was created.
    pub fn open_or_init(root: &Path) -> Result<(Self, bool)> {
        fs::create_dir_all(root)
            .with_context(|| format!("failed to create {}", root.display()))?;
        let repository = Self {
            root: root.to_path_buf(),
        };
        if root.join(".git").exists() {
            return Ok((repository, false));
        }
        repository.run_checked(&["init", "-q"])?;
        debug!(
            "event=repository_init module=vcs status=ok path={}",
            root.display()
        );
        Ok((repository, true))
    }

    fn command(&self) -> Command {
        let mut command = Command::new("git");
        command
            .arg("-C")
            .arg(&self.root)
            .args(["-c", "commit.gpgsign=false", "-c", "core.quotepath=off"]);
        command
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        self.command()
            .args(args)
            .output()
            .with_context(|| format!("failed to execute git {}", args.join(" ")))
    }

    fn run_checked(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args)?;
        check_output(args, &output)?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl VersionStore for GitRepository {
    fn root(&self) -> &Path {
        &self.root
    }

    fn has_commits(&self) -> Result<bool> {
        Ok(self
            .run(&["rev-parse", "--verify", "-q", "HEAD"])?
            .status
            .success())
    }

    fn move_path(&mut self, from: &str, to: &str) -> Result<()> {
        let source = self.root.join(from);
        let target = self.root.join(to);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::rename(&source, &target).with_context(|| {
            format!(
                "failed to move {} to {}",
                source.display(),
                target.display()
            )
        })?;
        self.run_checked(&["rm", "--cached", "-q", "--ignore-unmatch", "--", from])?;
        self.run_checked(&["add", "--", to])?;
        Ok(())
    }

    fn stage(&mut self, paths: &[String]) -> Result<()> {
        // `git add` rejects a pathspec that matches nothing on disk.
        let (present, missing): (Vec<&str>, Vec<&str>) = paths
            .iter()
            .map(String::as_str)
            .partition(|path| self.root.join(path).exists());
        if !missing.is_empty() {
            let mut args = vec!["rm", "--cached", "-r", "-q", "--ignore-unmatch", "--"];
            args.extend(missing);
            self.run_checked(&args)?;
        }
        if !present.is_empty() {
            let mut args = vec!["add", "-A", "--"];
            args.extend(present);
            self.run_checked(&args)?;
        }
        Ok(())
    }

    fn commit(&mut self, request: &CommitRequest) -> Result<String> {
        let mut command = self.command();
        command
            .args(["commit", "-q", "--allow-empty", "--no-verify", "-m"])
            .arg(&request.message)
            .env("GIT_AUTHOR_NAME", &request.author.name)
            .env("GIT_AUTHOR_EMAIL", &request.author.email)
            .env("GIT_COMMITTER_NAME", &request.author.name)
            .env("GIT_COMMITTER_EMAIL", &request.author.email);
        if let Some(timestamp) = request.timestamp.filter(|timestamp| *timestamp > 0) {
            let date = format!("{timestamp} +0000");
            command
                .env("GIT_AUTHOR_DATE", &date)
                .env("GIT_COMMITTER_DATE", &date);
        }
        let output = command.output().context("failed to execute git commit")?;
        check_output(&["commit"], &output)?;
        self.run_checked(&["rev-parse", "HEAD"])
    }

    fn read_committed(&self, path: &str) -> Result<Option<String>> {
        let spec = format!("HEAD:{path}");
        let output = self.run(&["show", &spec])?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).to_string()))
    }

    fn restore_head(&mut self, scope: &CleanScope<'_>) -> Result<()> {
        self.run_checked(&["reset", "-q", "--hard", "HEAD"])?;
        let untracked = self.run_checked(&["ls-files", "--others", "--exclude-standard", "-z"])?;
        let mut removed = 0usize;
        for path in untracked
            .split('\0')
            .filter(|path| !path.is_empty() && scope.contains(path))
        {
            let full = self.root.join(path);
            fs::remove_file(&full)
                .with_context(|| format!("failed to remove {}", full.display()))?;
            removed += 1;
        }
        debug!("event=working_copy_restored module=vcs removed={removed}");
        Ok(())
    }
}

fn check_output(args: &[&str], output: &Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    bail!(
        "git {} failed with exit code {}: {}",
        args.join(" "),
        output.status.code().unwrap_or(1),
        stderr.trim()
    )
}
