use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use git2::{BranchType, ErrorCode, Oid, Repository, Signature, Sort, StatusOptions};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use super::{BranchNote, CommitInfo, NOTES_REF, Vcs, WorktreeInfo};
use crate::errors::VcsError;
use crate::retry::RetryPolicy;

/// How far back from a branch tip to look for its metadata note.
const NOTE_SEARCH_DEPTH: usize = 256;

/// Notes are keyed by branch: several branches can share a tip commit.
type NoteBook = BTreeMap<String, BranchNote>;

/// `Vcs` over the `git` CLI (worktree management) and `git2` (reads, notes).
///
/// Every subprocess runs under a timeout and goes through the retry policy;
/// git2 calls run on the blocking pool.
pub struct GitVcs {
    root: PathBuf,
    timeout: Duration,
    retry: RetryPolicy,
}

impl GitVcs {
    /// Open the repository containing `project_dir`.
    pub fn discover(
        project_dir: &Path,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, VcsError> {
        let repo = Repository::discover(project_dir)?;
        let root = repo
            .workdir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| repo.path().to_path_buf());
        Ok(Self {
            root,
            timeout,
            retry,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> Result<String, VcsError> {
        let operation = format!("git {}", args.join(" "));
        self.retry
            .run(&operation, || self.git_once(cwd, args))
            .await
    }

    async fn git_once(&self, cwd: &Path, args: &[&str]) -> Result<String, VcsError> {
        let command = args.join(" ");
        debug!(command = %command, cwd = %cwd.display(), "running git");
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(cwd).kill_on_drop(true);
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| VcsError::Timeout {
                command: command.clone(),
                timeout: self.timeout,
            })?
            .map_err(VcsError::Spawn)?;

        if !output.status.success() {
            return Err(VcsError::CommandFailed {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run a git2 closure against the repository opened at `at` on the blocking pool.
    async fn with_repo<T, F>(&self, at: &Path, f: F) -> Result<T, VcsError>
    where
        T: Send + 'static,
        F: FnOnce(&Repository) -> Result<T, VcsError> + Send + 'static,
    {
        let at = at.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let repo = Repository::open(&at)?;
            f(&repo)
        })
        .await
        .map_err(|e| VcsError::CommandFailed {
            command: "repository task".to_string(),
            stderr: e.to_string(),
        })?
    }
}

fn path_str(path: &Path) -> Result<&str, VcsError> {
    path.to_str()
        .ok_or_else(|| VcsError::InvalidPath(path.to_path_buf()))
}

fn commit_time(time: git2::Time) -> DateTime<Utc> {
    Utc.timestamp_opt(time.seconds(), 0)
        .single()
        .unwrap_or_else(Utc::now)
}

fn branch_tip(repo: &Repository, branch: &str) -> Result<Option<Oid>, VcsError> {
    match repo.find_branch(branch, BranchType::Local) {
        Ok(b) => Ok(b.get().peel_to_commit().ok().map(|c| c.id())),
        Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn read_notebook(repo: &Repository, oid: Oid) -> Option<NoteBook> {
    let note = repo.find_note(Some(NOTES_REF), oid).ok()?;
    serde_json::from_str(note.message()?).ok()
}

fn signature(repo: &Repository) -> Result<Signature<'static>, VcsError> {
    Ok(repo
        .signature()
        .or_else(|_| Signature::now("weave", "weave@localhost"))?)
}

/// Parse `git worktree list --porcelain`.
pub fn parse_worktree_list(output: &str) -> Vec<WorktreeInfo> {
    let mut worktrees = Vec::new();
    let mut current: Option<WorktreeInfo> = None;

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(done) = current.take() {
                worktrees.push(done);
            }
            current = Some(WorktreeInfo {
                path: PathBuf::from(path),
                branch: None,
                head: None,
                prunable: false,
            });
            continue;
        }
        let Some(info) = current.as_mut() else {
            continue;
        };
        if let Some(head) = line.strip_prefix("HEAD ") {
            info.head = Some(head.to_string());
        } else if let Some(branch) = line.strip_prefix("branch ") {
            info.branch = Some(branch.trim_start_matches("refs/heads/").to_string());
        } else if line.starts_with("prunable") {
            info.prunable = true;
        }
    }
    if let Some(done) = current {
        worktrees.push(done);
    }
    worktrees
}

#[async_trait]
impl Vcs for GitVcs {
    async fn create_worktree(&self, path: &Path, branch: &str, base: &str) -> Result<(), VcsError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(VcsError::Io)?;
        }
        let path = path_str(path)?;
        self.git(&self.root, &["worktree", "add", "-b", branch, path, base])
            .await?;
        Ok(())
    }

    async fn attach_worktree(&self, path: &Path, branch: &str) -> Result<(), VcsError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(VcsError::Io)?;
        }
        let path = path_str(path)?;
        self.git(&self.root, &["worktree", "add", path, branch])
            .await?;
        Ok(())
    }

    async fn remove_worktree(&self, path: &Path, force: bool) -> Result<(), VcsError> {
        let path = path_str(path)?;
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(path);
        self.git(&self.root, &args).await?;
        Ok(())
    }

    async fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, VcsError> {
        let output = self
            .git(&self.root, &["worktree", "list", "--porcelain"])
            .await?;
        Ok(parse_worktree_list(&output))
    }

    async fn prune_worktrees(&self) -> Result<(), VcsError> {
        self.git(&self.root, &["worktree", "prune"]).await?;
        Ok(())
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool, VcsError> {
        let branch = branch.to_string();
        self.with_repo(&self.root, move |repo| {
            Ok(branch_tip(repo, &branch)?.is_some())
        })
        .await
    }

    async fn worktree_branch(&self, path: &Path) -> Result<Option<String>, VcsError> {
        self.with_repo(path, |repo| {
            let head = match repo.head() {
                Ok(head) => head,
                Err(e) if e.code() == ErrorCode::UnbornBranch => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            if !head.is_branch() {
                return Ok(None);
            }
            Ok(head.shorthand().map(str::to_string))
        })
        .await
    }

    async fn checkout(&self, path: &Path, branch: &str) -> Result<(), VcsError> {
        self.git(path, &["checkout", branch]).await?;
        Ok(())
    }

    async fn is_dirty(&self, path: &Path) -> Result<bool, VcsError> {
        self.with_repo(path, |repo| {
            let mut opts = StatusOptions::new();
            opts.include_untracked(true).include_ignored(false);
            Ok(!repo.statuses(Some(&mut opts))?.is_empty())
        })
        .await
    }

    async fn unpushed_commits(&self, path: &Path) -> Result<usize, VcsError> {
        self.with_repo(path, |repo| {
            let head = match repo.head() {
                Ok(head) => head,
                Err(e) if e.code() == ErrorCode::UnbornBranch => return Ok(0),
                Err(e) => return Err(e.into()),
            };
            let (Some(name), Some(local)) = (head.shorthand(), head.target()) else {
                return Ok(0);
            };
            if !head.is_branch() {
                return Ok(0);
            }
            let branch = repo.find_branch(name, BranchType::Local)?;
            let Ok(upstream) = branch.upstream() else {
                return Ok(0);
            };
            let Some(remote) = upstream.get().target() else {
                return Ok(0);
            };
            let (ahead, _behind) = repo.graph_ahead_behind(local, remote)?;
            Ok(ahead)
        })
        .await
    }

    async fn write_note(&self, branch: &str, note: &BranchNote) -> Result<(), VcsError> {
        let branch = branch.to_string();
        let note = note.clone();
        self.with_repo(&self.root, move |repo| {
            let tip = branch_tip(repo, &branch)?.ok_or_else(|| VcsError::CommandFailed {
                command: format!("notes add {}", branch),
                stderr: format!("branch {} not found", branch),
            })?;
            let mut book = read_notebook(repo, tip).unwrap_or_default();
            book.insert(branch.clone(), note);
            let message = serde_json::to_string_pretty(&book).map_err(|e| VcsError::Malformed {
                what: "branch note".to_string(),
                message: e.to_string(),
            })?;
            let sig = signature(repo)?;
            repo.note(&sig, &sig, Some(NOTES_REF), tip, &message, true)?;
            Ok(())
        })
        .await
    }

    async fn read_note(&self, branch: &str) -> Result<Option<BranchNote>, VcsError> {
        let branch = branch.to_string();
        self.with_repo(&self.root, move |repo| {
            let Some(tip) = branch_tip(repo, &branch)? else {
                return Ok(None);
            };
            let mut walk = repo.revwalk()?;
            walk.push(tip)?;
            walk.simplify_first_parent()?;
            for oid in walk.take(NOTE_SEARCH_DEPTH) {
                if let Some(mut book) = read_notebook(repo, oid?)
                    && let Some(note) = book.remove(&branch)
                {
                    return Ok(Some(note));
                }
            }
            Ok(None)
        })
        .await
    }

    async fn commits_since(
        &self,
        branch: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<CommitInfo>, VcsError> {
        let branch = branch.to_string();
        self.with_repo(&self.root, move |repo| {
            let Some(tip) = branch_tip(repo, &branch)? else {
                return Ok(Vec::new());
            };
            let mut walk = repo.revwalk()?;
            walk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)?;
            walk.push(tip)?;

            let mut commits = Vec::new();
            for oid in walk {
                let commit = repo.find_commit(oid?)?;
                let time = commit_time(commit.time());
                if time <= since {
                    break;
                }
                let tree = commit.tree()?;
                let parent_tree = match commit.parent(0) {
                    Ok(parent) => Some(parent.tree()?),
                    Err(_) => None,
                };
                let diff = repo.diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), None)?;
                let paths = diff
                    .deltas()
                    .filter_map(|d| d.new_file().path().or_else(|| d.old_file().path()))
                    .map(|p| p.to_string_lossy().to_string())
                    .collect();
                commits.push(CommitInfo {
                    id: commit.id().to_string(),
                    time,
                    summary: commit.summary().unwrap_or_default().to_string(),
                    paths,
                });
            }
            Ok(commits)
        })
        .await
    }

    async fn last_commit_time(&self, branch: &str) -> Result<Option<DateTime<Utc>>, VcsError> {
        let branch = branch.to_string();
        self.with_repo(&self.root, move |repo| {
            let Some(tip) = branch_tip(repo, &branch)? else {
                return Ok(None);
            };
            Ok(Some(commit_time(repo.find_commit(tip)?.time())))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::state::LifecycleState;
    use crate::role::Role;
    use tempfile::TempDir;

    /// Initialise a repository with one commit on the default branch.
    fn setup_repo() -> (TempDir, Repository) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        {
            let mut config = repo.config().unwrap();
            config.set_str("user.name", "Test").unwrap();
            config.set_str("user.email", "test@example.com").unwrap();
        }
        std::fs::write(dir.path().join("README.md"), "# test\n").unwrap();
        commit_all(&repo, "initial");
        (dir, repo)
    }

    fn commit_all(repo: &Repository, message: &str) -> Oid {
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = repo.signature().unwrap();
        let parents: Vec<git2::Commit> = repo
            .head()
            .ok()
            .and_then(|h| h.peel_to_commit().ok())
            .into_iter()
            .collect();
        let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
            .unwrap()
    }

    fn vcs(dir: &Path) -> GitVcs {
        GitVcs::discover(dir, Duration::from_secs(30), RetryPolicy::no_retry()).unwrap()
    }

    #[test]
    fn test_parse_worktree_list() {
        let output = "worktree /repo\nHEAD abc\nbranch refs/heads/main\n\nworktree /repo/.weave/worktrees/42\nHEAD def\nbranch refs/heads/task-42\n\nworktree /tmp/gone\nHEAD 123\ndetached\nprunable gitdir file points to non-existent location\n";
        let list = parse_worktree_list(output);
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].branch.as_deref(), Some("main"));
        assert_eq!(list[1].path, PathBuf::from("/repo/.weave/worktrees/42"));
        assert_eq!(list[1].branch.as_deref(), Some("task-42"));
        assert_eq!(list[2].branch, None);
        assert!(list[2].prunable);
    }

    #[tokio::test]
    async fn test_branch_exists_and_last_commit_time() {
        let (dir, repo) = setup_repo();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        repo.branch("task-1", &head, false).unwrap();

        let vcs = vcs(dir.path());
        assert!(vcs.branch_exists("task-1").await.unwrap());
        assert!(!vcs.branch_exists("task-2").await.unwrap());
        assert!(vcs.last_commit_time("task-1").await.unwrap().is_some());
        assert!(vcs.last_commit_time("task-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_notes_for_branches_sharing_a_tip() {
        let (dir, repo) = setup_repo();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        repo.branch("task-1", &head, false).unwrap();
        repo.branch("task-2", &head, false).unwrap();

        let vcs = vcs(dir.path());
        let note = |task: &str, role| BranchNote {
            task_id: task.to_string(),
            role,
            status: LifecycleState::Active,
            created_at: Utc::now(),
        };
        vcs.write_note("task-1", &note("1", Role::Engineer)).await.unwrap();
        vcs.write_note("task-2", &note("2", Role::Reviewer)).await.unwrap();

        let first = vcs.read_note("task-1").await.unwrap().unwrap();
        let second = vcs.read_note("task-2").await.unwrap().unwrap();
        assert_eq!(first.role, Role::Engineer);
        assert_eq!(second.task_id, "2");
        assert!(vcs.read_note("main").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_note_is_found_after_new_commits() {
        let (dir, repo) = setup_repo();
        let vcs = vcs(dir.path());
        let branch = repo.head().unwrap().shorthand().unwrap().to_string();
        vcs.write_note(
            &branch,
            &BranchNote {
                task_id: "9".into(),
                role: Role::Architect,
                status: LifecycleState::Active,
                created_at: Utc::now(),
            },
        )
        .await
        .unwrap();

        std::fs::write(dir.path().join("new.txt"), "x").unwrap();
        commit_all(&repo, "more work");
        let note = vcs.read_note(&branch).await.unwrap().unwrap();
        assert_eq!(note.task_id, "9");
    }

    #[tokio::test]
    async fn test_commits_since_collects_paths() {
        let (dir, repo) = setup_repo();
        let since = Utc::now() - chrono::Duration::days(1);
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        commit_all(&repo, "add a");
        let branch = repo.head().unwrap().shorthand().unwrap().to_string();

        let commits = vcs(dir.path()).commits_since(&branch, since).await.unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].summary, "add a");
        assert_eq!(commits[0].paths, vec!["a.txt".to_string()]);

        let none = vcs(dir.path())
            .commits_since(&branch, Utc::now() + chrono::Duration::days(1))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_worktree_lifecycle_via_cli() {
        let (dir, _repo) = setup_repo();
        let vcs = vcs(dir.path());
        let path = dir.path().join(".weave").join("worktrees").join("42");

        vcs.create_worktree(&path, "task-42", "HEAD").await.unwrap();
        assert!(path.join("README.md").exists());
        assert_eq!(
            vcs.worktree_branch(&path).await.unwrap().as_deref(),
            Some("task-42")
        );
        assert!(!vcs.is_dirty(&path).await.unwrap());
        assert_eq!(vcs.unpushed_commits(&path).await.unwrap(), 0);

        let listed = vcs.list_worktrees().await.unwrap();
        assert!(listed
            .iter()
            .any(|w| w.branch.as_deref() == Some("task-42")));

        std::fs::write(path.join("scratch.txt"), "wip").unwrap();
        assert!(vcs.is_dirty(&path).await.unwrap());
        assert!(vcs.remove_worktree(&path, false).await.is_err());
        vcs.remove_worktree(&path, true).await.unwrap();
        assert!(!path.exists());
        assert!(vcs.branch_exists("task-42").await.unwrap());

        vcs.attach_worktree(&path, "task-42").await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_create_worktree_on_taken_branch_fails_structurally() {
        use crate::retry::Transience;
        let (dir, _repo) = setup_repo();
        let vcs = vcs(dir.path());
        let first = dir.path().join("w1");
        let second = dir.path().join("w2");
        vcs.create_worktree(&first, "task-1", "HEAD").await.unwrap();
        let err = vcs
            .create_worktree(&second, "task-1", "HEAD")
            .await
            .unwrap_err();
        assert!(matches!(err, VcsError::CommandFailed { .. }));
        assert!(!err.is_transient());
    }
}
