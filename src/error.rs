use miette::Diagnostic;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Destination already exists: {0}")]
    #[diagnostic(
        code(roost::provision::already_exists),
        help("Pick a different instance name, or delete the existing checkout first")
    )]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    #[diagnostic(code(roost::not_found))]
    NotFound(String),

    #[error("Clone failed: {0}")]
    #[diagnostic(
        code(roost::provision::clone_failed),
        help("Check that the source URL is reachable and that you have access to it")
    )]
    CloneFailed(String),

    #[error("Failed to list remote branches: {0}")]
    #[diagnostic(
        code(roost::provision::list_failed),
        help("Check that the source URL is reachable and that you have access to it")
    )]
    ListFailed(String),

    #[error("Version not found: {0}")]
    #[diagnostic(
        code(roost::provision::version_not_found),
        help("The reference must resolve to a branch, tag, or commit in the source repository")
    )]
    VersionNotFound(String),

    #[error("Local branch has diverged from upstream in {0}")]
    #[diagnostic(
        code(roost::provision::non_fast_forward),
        help("The checkout has local commits that are not on the remote. Roost never force-resets; reconcile the checkout manually")
    )]
    NonFastForward(PathBuf),

    #[error("Invalid status '{0}': expected 'running' or 'stopped'")]
    #[diagnostic(code(roost::lifecycle::invalid_status))]
    InvalidStatus(String),

    #[error("Failed to spawn process: {0}")]
    #[diagnostic(
        code(roost::supervisor::spawn_failed),
        help("Check that the command exists and is executable in the instance checkout")
    )]
    SpawnFailed(String),

    #[error("Failed to signal pid {pid}: {errno}")]
    #[diagnostic(code(roost::supervisor::signal))]
    Signal { pid: u32, errno: nix::errno::Errno },

    #[error("Invalid PID {pid}: {reason}")]
    InvalidPid { pid: u32, reason: String },

    #[error("Worktree mirroring failed: {0}")]
    #[diagnostic(
        code(roost::provision::mirror),
        help("The destination may be partially patched. Delete it and provision again, or commit the source's local changes")
    )]
    Mirror(String),

    #[error("Filesystem error: {0}")]
    #[diagnostic(code(roost::filesystem))]
    Filesystem(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Store error: {0}")]
    #[diagnostic(code(roost::store))]
    Store(#[from] tokio_rusqlite::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Validates and converts a u32 PID to nix::unistd::Pid for signal operations.
/// Returns Err for PID 0 (process group), PID 1 (init), or values > i32::MAX.
pub fn validate_pid(pid: u32) -> Result<nix::unistd::Pid> {
    if pid == 0 {
        return Err(Error::InvalidPid {
            pid,
            reason: "PID 0 refers to the process group, not a process".to_string(),
        });
    }
    if pid == 1 {
        return Err(Error::InvalidPid {
            pid,
            reason: "refusing to signal PID 1 (init)".to_string(),
        });
    }
    if pid > i32::MAX as u32 {
        return Err(Error::InvalidPid {
            pid,
            reason: "exceeds i32::MAX, cannot convert safely".to_string(),
        });
    }
    Ok(nix::unistd::Pid::from_raw(pid as i32))
}

/// Same as validate_pid but permits PID 1, for read-only existence probes.
pub fn validate_pid_for_check(pid: u32) -> Option<nix::unistd::Pid> {
    if pid == 0 || pid > i32::MAX as u32 {
        return None;
    }
    Some(nix::unistd::Pid::from_raw(pid as i32))
}
