use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Stdio};
use std::thread::JoinHandle;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;

use super::{ArchiveReader, ChangeStatus, ChangedPath, GitService, RevListPage};

/// `GitService` backed by the local `git` binary. Repository names are paths,
/// resolved against `root` when relative.
#[derive(Debug, Clone, Default)]
pub struct GitCli {
    root: Option<PathBuf>,
}

impl GitCli {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    pub fn repo_dir(&self, repo: &str) -> PathBuf {
        let path = Path::new(repo);
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Resolves a revision such as `HEAD` or a branch name to a full hash.
    pub async fn resolve_revision(&self, repo: &str, revision: &str) -> Result<String> {
        let spec = format!("{revision}^{{commit}}");
        let out = self
            .run(repo, &["rev-parse", "--verify", "--quiet", &spec])
            .await
            .with_context(|| format!("Unknown revision {revision} in {repo}"))?;
        let hash = String::from_utf8_lossy(&out).trim().to_string();
        if hash.is_empty() {
            bail!("Unknown revision {revision} in {repo}");
        }
        Ok(hash)
    }

    async fn run(&self, repo: &str, args: &[&str]) -> Result<Vec<u8>> {
        let dir = self.repo_dir(repo);
        let output = Command::new("git")
            .arg("-C")
            .arg(&dir)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to run git in {}", dir.display()))?;
        if !output.status.success() {
            bail!(
                "git {} failed in {}: {}",
                args.first().copied().unwrap_or_default(),
                dir.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl GitService for GitCli {
    async fn rev_list(&self, repo: &str, cursor: &str, page_size: usize) -> Result<RevListPage> {
        let max_count = format!("--max-count={}", page_size + 1);
        let out = self
            .run(repo, &["rev-list", "--first-parent", &max_count, cursor])
            .await?;
        let mut commits: Vec<String> = String::from_utf8_lossy(&out)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        // The extra commit, when present, is where the next page starts.
        let next_cursor = if commits.len() > page_size {
            commits.pop()
        } else {
            None
        };
        Ok(RevListPage {
            commits,
            next_cursor,
        })
    }

    async fn changed_files(
        &self,
        repo: &str,
        base: Option<&str>,
        head: &str,
    ) -> Result<Vec<ChangedPath>> {
        match base {
            None => {
                let out = self
                    .run(repo, &["ls-tree", "-r", "-z", "--name-only", head])
                    .await?;
                Ok(split_nul(&out)
                    .map(|path| ChangedPath::new(path, ChangeStatus::Added))
                    .collect())
            }
            Some(base) => {
                let out = self
                    .run(
                        repo,
                        &[
                            "diff-tree",
                            "-r",
                            "-z",
                            "--no-renames",
                            "--name-status",
                            base,
                            head,
                        ],
                    )
                    .await?;
                parse_name_status(&out)
            }
        }
    }

    async fn archive(
        &self,
        repo: &str,
        commit: &str,
        paths: Option<&[String]>,
    ) -> Result<ArchiveReader> {
        let dir = self.repo_dir(repo);
        let mut cmd = std::process::Command::new("git");
        cmd.arg("-C")
            .arg(&dir)
            .args(["archive", "--format=tar", commit]);
        if let Some(paths) = paths {
            cmd.arg("--");
            for path in paths {
                cmd.arg(format!(":(literal){path}"));
            }
        }
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn git archive in {}", dir.display()))?;
        let stdout = child
            .stdout
            .take()
            .context("git archive stdout was not captured")?;
        let mut stderr = child
            .stderr
            .take()
            .context("git archive stderr was not captured")?;
        // Drained on its own thread so a chatty git cannot stall stdout.
        let stderr = std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf);
            buf
        });
        Ok(Box::new(ChildArchive {
            child,
            stdout,
            stderr: Some(stderr),
            finished: false,
        }))
    }
}

/// Streams `git archive` output and reports a failed exit as a read error.
struct ChildArchive {
    child: Child,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<Vec<u8>>>,
    finished: bool,
}

impl Read for ChildArchive {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stdout.read(buf)?;
        if n == 0 && !buf.is_empty() && !self.finished {
            self.finished = true;
            let status = self.child.wait()?;
            if !status.success() {
                let stderr = self
                    .stderr
                    .take()
                    .and_then(|handle| handle.join().ok())
                    .unwrap_or_default();
                return Err(io::Error::other(format!(
                    "git archive exited with {status}: {}",
                    String::from_utf8_lossy(&stderr).trim()
                )));
            }
        }
        Ok(n)
    }
}

impl Drop for ChildArchive {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn split_nul(out: &[u8]) -> impl Iterator<Item = String> + '_ {
    out.split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
}

/// Parses `--name-status -z` output: alternating status and path fields.
fn parse_name_status(out: &[u8]) -> Result<Vec<ChangedPath>> {
    let mut fields = split_nul(out);
    let mut changes = Vec::new();
    while let Some(code) = fields.next() {
        let Some(path) = fields.next() else {
            bail!("Truncated diff-tree output after status {code}");
        };
        match ChangeStatus::from_code(&code) {
            Some(status) => changes.push(ChangedPath::new(path, status)),
            None => tracing::debug!(status = %code, path = %path, "Ignoring unknown change status"),
        }
    }
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_name_status() {
        let out = b"A\0src/new.rs\0M\0README.md\0D\0old file.txt\0T\0link\0";
        let changes = parse_name_status(out).unwrap();
        assert_eq!(
            changes,
            vec![
                ChangedPath::new("src/new.rs", ChangeStatus::Added),
                ChangedPath::new("README.md", ChangeStatus::Modified),
                ChangedPath::new("old file.txt", ChangeStatus::Deleted),
                ChangedPath::new("link", ChangeStatus::TypeChanged),
            ]
        );
    }

    #[test]
    fn test_parse_name_status_truncated() {
        assert!(parse_name_status(b"A\0").is_err());
    }

    #[test]
    fn test_parse_name_status_empty() {
        assert!(parse_name_status(b"").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_archive_failure_reports_git_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let git = GitCli::new();
        let mut reader = git
            .archive(dir.path().to_str().unwrap(), "HEAD", None)
            .await
            .unwrap();
        let err = reader.read_to_end(&mut Vec::new()).unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("git archive exited with"), "{message}");
        assert!(message.contains("fatal:"), "{message}");
    }

    #[test]
    fn test_repo_dir_resolution() {
        let git = GitCli::with_root("/srv/repos");
        assert_eq!(git.repo_dir("github.com/a/b"), PathBuf::from("/srv/repos/github.com/a/b"));
        assert_eq!(git.repo_dir("/abs/repo"), PathBuf::from("/abs/repo"));
        assert_eq!(GitCli::new().repo_dir("rel"), PathBuf::from("rel"));
    }
}
