//! Repository provisioning: clone, checkout, in-place update, and local
//! worktree mirroring.
//!
//! All git work is blocking libgit2; callers run it via `spawn_blocking`.
//!
//! Worktree mirroring is a development convenience: when the source is itself a
//! local working tree and no explicit version was requested, its uncommitted
//! state is replayed into the fresh clone so a developer can iterate without
//! committing. An explicit version pin means "exactly this published state" and
//! skips mirroring entirely.

use crate::config::DATA_DIR_NAME;
use crate::error::{Error, Result};
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{
    ApplyLocation, AutotagOption, DiffOptions, Direction, FetchOptions, Remote, Repository,
    StatusOptions,
};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Top-level path segments never mirrored from a local source worktree.
/// Dependency caches, generated instance checkouts, secrets, and bytecode
/// caches must not leak into a provisioned instance.
const MIRROR_DENYLIST: &[&str] = &[
    "node_modules",
    "instances",
    "secrets",
    "__pycache__",
    ".venv",
    ".git",
];

/// Seam between lifecycle management and version control.
///
/// Sync by design: implementations block on subprocess-free libgit2 calls and
/// are driven from `spawn_blocking`.
pub trait Provisioner: Send + Sync {
    /// Clone `source` into `dest`, optionally checking out `version`.
    /// Fails with `AlreadyExists` if `dest` exists; never overwrites.
    fn provision(&self, source: &str, dest: &Path, version: Option<&str>) -> Result<()>;

    /// Fetch all refs and tags into an existing checkout, then either check
    /// out `version` or fast-forward the current branch.
    fn update(&self, dest: &Path, version: Option<&str>) -> Result<()>;

    /// Remote branch names, lexicographically sorted, duplicates removed.
    fn list_remote_branches(&self, source: &str) -> Result<Vec<String>>;
}

/// libgit2-backed provisioner.
#[derive(Debug, Default, Clone)]
pub struct GitProvisioner;

impl GitProvisioner {
    pub fn new() -> Self {
        Self
    }

    /// If `source` refers to a local directory that is a non-bare working
    /// tree, return its path. `file://` URLs count as local.
    fn local_worktree(source: &str) -> Option<PathBuf> {
        let path = Path::new(source.strip_prefix("file://").unwrap_or(source));
        if !path.is_dir() {
            return None;
        }
        let repo = Repository::open(path).ok()?;
        repo.workdir()?;
        Some(path.to_path_buf())
    }

    /// Replay the source worktree's uncommitted state into `dest`:
    /// tracked changes as a patch, untracked files as copies.
    fn mirror_worktree(&self, source: &Path, dest: &Path) -> Result<()> {
        let src_repo = Repository::open(source)?;

        let mut diff_opts = DiffOptions::new();
        diff_opts.show_binary(true);
        let diff = src_repo.diff_index_to_workdir(None, Some(&mut diff_opts))?;

        if diff.deltas().len() > 0 {
            tracing::debug!(
                deltas = diff.deltas().len(),
                dest = %dest.display(),
                "applying uncommitted source changes"
            );
            let dest_repo = Repository::open(dest)?;
            // A conflicting hunk aborts here and leaves the destination
            // partially patched; the failure is surfaced, never swallowed.
            dest_repo
                .apply(&diff, ApplyLocation::WorkDir, None)
                .map_err(|e| {
                    Error::Mirror(format!("applying uncommitted diff: {}", e.message()))
                })?;
        }

        let mut status_opts = StatusOptions::new();
        status_opts
            .include_untracked(true)
            .recurse_untracked_dirs(true)
            .exclude_submodules(true);
        let statuses = src_repo.statuses(Some(&mut status_opts))?;

        for entry in statuses.iter() {
            if !entry.status().contains(git2::Status::WT_NEW) {
                continue;
            }
            let Some(rel) = entry.path() else {
                continue;
            };
            if Self::is_denied(rel) {
                tracing::trace!(path = rel, "skipping deny-listed untracked path");
                continue;
            }
            let to = dest.join(rel);
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| Error::Mirror(format!("creating {}: {e}", parent.display())))?;
            }
            fs::copy(source.join(rel), &to)
                .map_err(|e| Error::Mirror(format!("copying {rel}: {e}")))?;
        }

        Ok(())
    }

    fn is_denied(rel: &str) -> bool {
        let first = rel.split('/').next().unwrap_or(rel);
        MIRROR_DENYLIST.contains(&first) || first == DATA_DIR_NAME
    }

    /// Check out a version reference, resolving plain branch names against
    /// `origin/` when needed (a fresh clone only has remote-tracking branches).
    fn checkout_version(repo: &Repository, version: &str) -> Result<()> {
        let (object, reference) = repo
            .revparse_ext(version)
            .or_else(|_| repo.revparse_ext(&format!("origin/{version}")))
            .map_err(|_| Error::VersionNotFound(version.to_string()))?;

        repo.checkout_tree(&object, None)?;
        match reference.as_ref().and_then(git2::Reference::name) {
            Some(name) if name.starts_with("refs/heads/") => repo.set_head(name)?,
            _ => repo.set_head_detached(object.id())?,
        }
        Ok(())
    }

    /// Fast-forward the current branch onto its `origin` counterpart.
    /// Never force-overwrites local commits.
    fn fast_forward(repo: &Repository, dest: &Path) -> Result<()> {
        let head = repo.head()?;
        if !head.is_branch() {
            // Detached HEAD (a pinned version) has no branch to fast-forward.
            return Err(Error::NonFastForward(dest.to_path_buf()));
        }
        let branch = head
            .shorthand()
            .ok_or_else(|| Error::Filesystem(format!("unnamed HEAD in {}", dest.display())))?
            .to_string();
        drop(head);

        let remote_ref = repo
            .find_reference(&format!("refs/remotes/origin/{branch}"))
            .map_err(|_| Error::NotFound(format!("no upstream branch origin/{branch}")))?;
        let annotated = repo.reference_to_annotated_commit(&remote_ref)?;

        let (analysis, _) = repo.merge_analysis(&[&annotated])?;
        if analysis.is_up_to_date() {
            return Ok(());
        }
        if !analysis.is_fast_forward() {
            return Err(Error::NonFastForward(dest.to_path_buf()));
        }

        let refname = format!("refs/heads/{branch}");
        let mut reference = repo.find_reference(&refname)?;
        reference.set_target(annotated.id(), "roost: fast-forward")?;
        repo.set_head(&refname)?;
        repo.checkout_head(Some(CheckoutBuilder::new().force()))?;
        tracing::debug!(branch = %branch, dest = %dest.display(), "fast-forwarded");
        Ok(())
    }
}

impl Provisioner for GitProvisioner {
    fn provision(&self, source: &str, dest: &Path, version: Option<&str>) -> Result<()> {
        if dest.exists() {
            return Err(Error::AlreadyExists(dest.display().to_string()));
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        tracing::info!(source, dest = %dest.display(), ?version, "provisioning checkout");
        RepoBuilder::new()
            .clone(source, dest)
            .map_err(|e| Error::CloneFailed(format!("{source}: {}", e.message())))?;

        match version {
            Some(version) => {
                let repo = Repository::open(dest)?;
                Self::checkout_version(&repo, version)?;
            }
            None => {
                if let Some(src_dir) = Self::local_worktree(source) {
                    self.mirror_worktree(&src_dir, dest)?;
                }
            }
        }
        Ok(())
    }

    fn update(&self, dest: &Path, version: Option<&str>) -> Result<()> {
        if !dest.exists() {
            return Err(Error::NotFound(format!("no checkout at {}", dest.display())));
        }
        let repo = Repository::open(dest)
            .map_err(|_| Error::NotFound(format!("no repository at {}", dest.display())))?;

        {
            let mut remote = repo.find_remote("origin")?;
            let mut opts = FetchOptions::new();
            opts.download_tags(AutotagOption::All);
            remote
                .fetch(&[] as &[&str], Some(&mut opts), None)
                .map_err(|e| Error::CloneFailed(format!("fetch: {}", e.message())))?;
        }

        match version {
            Some(version) => Self::checkout_version(&repo, version),
            None => Self::fast_forward(&repo, dest),
        }
    }

    fn list_remote_branches(&self, source: &str) -> Result<Vec<String>> {
        let list_err = |e: git2::Error| Error::ListFailed(format!("{source}: {}", e.message()));

        let mut remote = Remote::create_detached(source).map_err(list_err)?;
        remote.connect(Direction::Fetch).map_err(list_err)?;

        let names: BTreeSet<String> = remote
            .list()
            .map_err(list_err)?
            .iter()
            .filter_map(|head| head.name().strip_prefix("refs/heads/"))
            .map(str::to_string)
            .collect();

        Ok(names.into_iter().collect())
    }
}
