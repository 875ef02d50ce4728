//! Checked out state of the git working trees.
//!
//! A full backup records branch and commit of every repository in
//! `repositories.json`; a restore checks both out again.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use derive_more::{Display, Error, From};

use crate::process::{CommandError, CommandRunner, CommandSpec};

/// Key of the primary checkout.
pub const MAIN_REPOSITORY: &str = "main";

/// Branch and commit of one working tree.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Checkout {
    pub branch: String,
    pub commit: String,
}

/// Content of `repositories.json`: repository key → [Checkout].
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct RepositoryDescriptor(pub BTreeMap<String, Checkout>);

#[derive(Debug, Display, Error, From)]
pub enum RepositoryError {
    #[display("git failed: {_0}")]
    Git(CommandError),
    #[display("repository descriptor I/O: {_0}")]
    Io(io::Error),
    #[display("repository descriptor is invalid: {_0}")]
    Json(serde_json::Error),
}

impl RepositoryDescriptor {
    pub fn insert(&mut self, key: impl Into<String>, checkout: Checkout) {
        self.0.insert(key.into(), checkout);
    }

    pub fn get(&self, key: &str) -> Option<&Checkout> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Checkout)> {
        self.0.iter()
    }

    pub fn read(path: &Path) -> Result<Self, RepositoryError> {
        let content = fs::read(path)?;
        Ok(serde_json::from_slice(&content)?)
    }

    pub fn write(&self, path: &Path) -> Result<(), RepositoryError> {
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

/// Git operations on a working tree.
pub struct Git<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> Git<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }

    fn git(&self, worktree: &Path, args: &[&str]) -> Result<String, RepositoryError> {
        let spec = CommandSpec::new("git").args(args.iter().copied()).current_dir(worktree);
        let output = self.runner.run(&spec)?;
        Ok(output.stdout.trim().to_string())
    }

    /// Current branch (`HEAD` if detached) and commit of `worktree`.
    pub fn current(&self, worktree: &Path) -> Result<Checkout, RepositoryError> {
        let branch = self.git(worktree, &["rev-parse", "--abbrev-ref", "HEAD"])?;
        let commit = self.git(worktree, &["rev-parse", "HEAD"])?;
        Ok(Checkout { branch, commit })
    }

    /// Check out `checkout.branch`, then `checkout.commit`.
    pub fn checkout(&self, worktree: &Path, checkout: &Checkout) -> Result<(), RepositoryError> {
        log::info!(
            target: "repositories",
            "Checking out {} at {} in {}",
            checkout.branch,
            checkout.commit,
            worktree.display()
        );
        self.git(worktree, &["checkout", checkout.branch.as_str()])?;
        self.git(worktree, &["checkout", checkout.commit.as_str()])?;
        Ok(())
    }

    /// Write a tar of the tree at `HEAD` to `target`.
    pub fn archive_head(&self, worktree: &Path, target: &Path) -> Result<(), RepositoryError> {
        let spec = CommandSpec::new("git")
            .args(["archive", "--format=tar", "HEAD"])
            .current_dir(worktree)
            .stdout_to(target);
        self.runner.run(&spec)?;
        Ok(())
    }
}
