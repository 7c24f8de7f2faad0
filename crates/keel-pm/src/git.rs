//! Git invocation
//!
//! Runs `git` without terminal prompts, polling the caller's cancellation
//! while the process runs.

use crate::cancel::Cancellation;
use crate::fetch::FetchError;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Run `git` with `args`, returning trimmed stdout.
pub fn run_git(cancel: &dyn Cancellation, args: &[&str], cwd: Option<&Path>) -> Result<String, FetchError> {
    if cancel.is_cancelled() {
        return Err(FetchError::Cancelled);
    }

    let mut cmd = Command::new("git");
    cmd.args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let label = format!("git {}", args.first().copied().unwrap_or_default());
    tracing::debug!(command = %label, args = ?args, "running git");

    let mut child = cmd.spawn().map_err(|e| FetchError::Invocation {
        command: label.clone(),
        message: format!("failed to execute git: {}", e),
    })?;

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    thread::scope(|s| {
        let out_reader = s.spawn(move || {
            let mut buf = String::new();
            if let Some(out) = stdout.as_mut() {
                let _ = out.read_to_string(&mut buf);
            }
            buf
        });
        let err_reader = s.spawn(move || {
            let mut buf = String::new();
            if let Some(err) = stderr.as_mut() {
                let _ = err.read_to_string(&mut buf);
            }
            buf
        });

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Ok(status),
                Ok(None) => {
                    if cancel.is_cancelled() {
                        let _ = child.kill();
                        let _ = child.wait();
                        break Err(FetchError::Cancelled);
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    break Err(FetchError::Invocation {
                        command: label.clone(),
                        message: e.to_string(),
                    })
                }
            }
        };

        let out = out_reader.join().unwrap_or_default();
        let err = err_reader.join().unwrap_or_default();
        let status = status?;

        if !status.success() {
            return Err(FetchError::Invocation {
                command: label.clone(),
                message: format!("exited with {}: {}", status, err.trim()),
            });
        }

        Ok(out.trim().to_string())
    })
}

/// Repositories and versions come from remote documents; neither may be
/// taken for an option.
fn clone_args<'a>(repository: &'a str, dest: &'a str) -> [&'a str; 5] {
    ["clone", "-q", "--", repository, dest]
}

fn ls_remote_args(repository: &str) -> [&str; 5] {
    ["ls-remote", "-q", "--", repository, "HEAD"]
}

/// Clone `repository` into `dest`.
pub fn clone(cancel: &dyn Cancellation, repository: &str, dest: &Path) -> Result<(), FetchError> {
    let dest = dest.to_string_lossy();
    run_git(cancel, &clone_args(repository, dest.as_ref()), None).map(|_| ())
}

/// Hard-reset the checkout in `dir` to `version`.
pub fn reset_hard(cancel: &dyn Cancellation, dir: &Path, version: &str) -> Result<(), FetchError> {
    if version.is_empty() || version.starts_with('-') {
        return Err(FetchError::InvalidFormat(format!("invalid module version {:?}", version)));
    }
    run_git(cancel, &["reset", "-q", "--hard", version], Some(dir)).map(|_| ())
}

/// Resolve the commit `HEAD` points at in `repository`.
pub fn ls_remote_head(cancel: &dyn Cancellation, repository: &str) -> Result<String, FetchError> {
    let out = run_git(cancel, &ls_remote_args(repository), None)?;
    parse_ls_remote_head(&out).ok_or_else(|| FetchError::Invocation {
        command: "git ls-remote".to_string(),
        message: format!("{}: failed to resolve HEAD", repository),
    })
}

/// Extract the commit from `<commit>\tHEAD` output.
pub fn parse_ls_remote_head(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let commit = line.trim().strip_suffix("\tHEAD")?.trim();
        if commit.is_empty() {
            None
        } else {
            Some(commit.to_string())
        }
    })
}
