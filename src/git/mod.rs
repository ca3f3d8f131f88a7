//! Thin facade over a child `git` process (§4, §6.3 Git driver).
//!
//! Every call here shells out; nothing is cached or batched except the
//! explicit `update-ref --stdin` queue, which mirrors the original's
//! `pending_ref_updates`/`pending_ref_delete` pair.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::errors::{ConvertError, Result};
use crate::hash::ObjectHash;

/// Per-call environment overrides. `work_tree`/`index_file` let many
/// branches share one bare repository while keeping separate worktrees and
/// index files (`GIT_INDEX_FILE=.git.index<index_seq>`, §4.10).
#[derive(Debug, Clone, Default)]
pub struct GitEnv {
    pub work_tree: Option<PathBuf>,
    pub index_file: Option<PathBuf>,
}

impl GitEnv {
    pub fn for_workdir(work_tree: impl Into<PathBuf>, index_file: impl Into<PathBuf>) -> GitEnv {
        GitEnv { work_tree: Some(work_tree.into()), index_file: Some(index_file.into()) }
    }

    fn apply(&self, cmd: &mut Command) {
        if let Some(wt) = &self.work_tree {
            cmd.env("GIT_WORK_TREE", wt);
        }
        if let Some(idx) = &self.index_file {
            cmd.env("GIT_INDEX_FILE", idx);
        }
    }
}

/// A blob hash still being computed on a background thread (§E).
pub struct PendingHash {
    handle: JoinHandle<Result<ObjectHash>>,
}

impl PendingHash {
    /// Blocks until the hash is ready.
    pub fn resolve(self) -> Result<ObjectHash> {
        self.handle.join().unwrap_or_else(|_| Err(ConvertError::GitSubprocessFailed("hash-object thread panicked".into())))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Signature<'a> {
    pub name: &'a str,
    pub email: Option<&'a str>,
    pub date: &'a str,
}

/// Facade over `git` invoked as a subprocess against one repository.
pub struct GitDriver {
    repo_path: PathBuf,
    pending_ref_updates: Mutex<Vec<(String, ObjectHash)>>,
    pending_ref_deletes: Mutex<Vec<String>>,
    total_hashed_files: AtomicU64,
    total_hashed_bytes: AtomicU64,
    total_commits_made: AtomicU64,
}

impl GitDriver {
    pub fn new(repo_path: impl Into<PathBuf>) -> GitDriver {
        GitDriver {
            repo_path: repo_path.into(),
            pending_ref_updates: Mutex::new(Vec::new()),
            pending_ref_deletes: Mutex::new(Vec::new()),
            total_hashed_files: AtomicU64::new(0),
            total_hashed_bytes: AtomicU64::new(0),
            total_commits_made: AtomicU64::new(0),
        }
    }

    fn cwd<'a>(&'a self, env: &'a GitEnv) -> &'a Path {
        env.work_tree.as_deref().unwrap_or(&self.repo_path)
    }

    fn spawn(&self, args: &[&str], env: &GitEnv, stdin: Stdio, stdout: Stdio) -> Result<Child> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(self.cwd(env))
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::piped());
        env.apply(&mut cmd);
        cmd.spawn().map_err(|e| ConvertError::GitSubprocessFailed(format!("spawn `git {}`: {e}", args.join(" "))))
    }

    fn wait_ok(mut child: Child, action: &str) -> Result<Child> {
        let status = child.wait().map_err(|e| ConvertError::GitSubprocessFailed(format!("{action}: {e}")))?;
        if !status.success() {
            return Err(ConvertError::GitSubprocessFailed(format!("{action} exited with {status}")));
        }
        Ok(child)
    }

    /// Streams `data` to `git hash-object --stdin -w -t blob`, returning the
    /// resulting object hash. `path` selects attribute-aware filtering
    /// (`--path=P`); `None` passes `--no-filters`.
    pub fn hash_object(&self, data: &[u8], path: Option<&str>, env: &GitEnv) -> Result<ObjectHash> {
        let path_arg = path.map(|p| format!("--path={p}"));
        let mut args = vec!["-c", "core.safecrlf=false", "hash-object", "-t", "blob", "-w", "--stdin"];
        args.push(path_arg.as_deref().unwrap_or("--no-filters"));

        let mut child = self.spawn(&args, env, Stdio::piped(), Stdio::piped())?;
        child
            .stdin
            .take()
            .expect("piped stdin")
            .write_all(data)
            .map_err(|e| ConvertError::GitSubprocessFailed(format!("hash-object stdin: {e}")))?;
        let output = child.wait_with_output().map_err(|e| ConvertError::GitSubprocessFailed(format!("hash-object: {e}")))?;
        if !output.status.success() {
            return Err(ConvertError::GitSubprocessFailed(format!("hash-object exited with {}", output.status)));
        }
        let line = String::from_utf8_lossy(&output.stdout);
        let hash: ObjectHash = line
            .trim()
            .parse()
            .map_err(|e| ConvertError::GitSubprocessFailed(format!("hash-object produced invalid hash: {e}")))?;

        self.total_hashed_files.fetch_add(1, Ordering::Relaxed);
        self.total_hashed_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(hash)
    }

    /// Fire-and-forget variant handing the blocking call to a background
    /// thread; the scheduler's hashing pool is the usual caller (§4.10), but
    /// this also works standalone.
    pub fn hash_object_async(self: &std::sync::Arc<Self>, data: Vec<u8>, path: Option<String>, env: GitEnv) -> PendingHash {
        let driver = std::sync::Arc::clone(self);
        let handle = std::thread::spawn(move || driver.hash_object(&data, path.as_deref(), &env));
        PendingHash { handle }
    }

    /// Opens `git update-index --add --force-remove --index-info` and
    /// returns a session the caller feeds `<mode> <sha1> 0\t<path>\n` lines
    /// into (or the zero-hash delete line).
    pub fn update_index(&self, env: &GitEnv) -> Result<UpdateIndexSession> {
        let child = self.spawn(&["update-index", "--add", "--force-remove", "--index-info"], env, Stdio::piped(), Stdio::null())?;
        Ok(UpdateIndexSession { child })
    }

    pub fn read_tree(&self, options: &[&str], env: &GitEnv) -> Result<()> {
        let mut args = vec!["read-tree"];
        args.extend_from_slice(options);
        let child = self.spawn(&args, env, Stdio::null(), Stdio::null())?;
        Self::wait_ok(child, "read-tree")?;
        Ok(())
    }

    pub fn write_tree(&self, env: &GitEnv) -> Result<ObjectHash> {
        let child = self.spawn(&["write-tree"], env, Stdio::null(), Stdio::piped())?;
        let output = child.wait_with_output().map_err(|e| ConvertError::GitSubprocessFailed(format!("write-tree: {e}")))?;
        if !output.status.success() {
            return Err(ConvertError::GitSubprocessFailed(format!("write-tree exited with {}", output.status)));
        }
        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .map_err(|e| ConvertError::GitSubprocessFailed(format!("write-tree produced invalid hash: {e}")))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn commit_tree(
        &self,
        tree: ObjectHash,
        parents: &[ObjectHash],
        message: &str,
        author: Signature,
        committer: Signature,
    ) -> Result<ObjectHash> {
        let mut cmd = Command::new("git");
        cmd.arg("commit-tree").arg(tree.to_string());
        for parent in parents {
            cmd.arg("-p").arg(parent.to_string());
        }
        cmd.current_dir(&self.repo_path)
            .env("GIT_AUTHOR_NAME", author.name)
            .env("GIT_AUTHOR_EMAIL", author.email.map(String::from).unwrap_or_else(|| format!("{}@localhost", author.name)))
            .env("GIT_AUTHOR_DATE", author.date)
            .env("GIT_COMMITTER_NAME", committer.name)
            .env(
                "GIT_COMMITTER_EMAIL",
                committer.email.map(String::from).unwrap_or_else(|| format!("{}@localhost", committer.name)),
            )
            .env("GIT_COMMITTER_DATE", committer.date)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| ConvertError::GitSubprocessFailed(format!("spawn commit-tree: {e}")))?;
        let msg = if message.is_empty() { "No message" } else { message };
        child
            .stdin
            .take()
            .expect("piped stdin")
            .write_all(msg.as_bytes())
            .map_err(|e| ConvertError::GitSubprocessFailed(format!("commit-tree stdin: {e}")))?;
        let output = child.wait_with_output().map_err(|e| ConvertError::GitSubprocessFailed(format!("commit-tree: {e}")))?;
        if !output.status.success() {
            return Err(ConvertError::GitSubprocessFailed(format!("commit-tree exited with {}", output.status)));
        }
        let hash = String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .map_err(|e| ConvertError::GitSubprocessFailed(format!("commit-tree produced invalid hash: {e}")))?;
        self.total_commits_made.fetch_add(1, Ordering::Relaxed);
        Ok(hash)
    }

    pub fn tag(&self, tagname: &str, target: ObjectHash, messages: &[String], tagger: Signature) -> Result<()> {
        let mut cmd = Command::new("git");
        cmd.arg("tag").arg(tagname).arg(target.to_string()).arg("-a").arg("-f");
        for msg in messages {
            cmd.arg("-m").arg(msg);
        }
        cmd.current_dir(&self.repo_path)
            .env("GIT_COMMITTER_NAME", tagger.name)
            .env("GIT_COMMITTER_EMAIL", tagger.email.map(String::from).unwrap_or_else(|| format!("{}@localhost", tagger.name)))
            .env("GIT_COMMITTER_DATE", tagger.date)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        let child = cmd.spawn().map_err(|e| ConvertError::GitSubprocessFailed(format!("spawn tag: {e}")))?;
        Self::wait_ok(child, "tag")?;
        Ok(())
    }

    pub fn for_each_ref(&self, options: &[&str]) -> Result<Vec<String>> {
        let mut args = vec!["for-each-ref"];
        args.extend_from_slice(options);
        let child = self.spawn(&args, &GitEnv::default(), Stdio::null(), Stdio::piped())?;
        let output = child.wait_with_output().map_err(|e| ConvertError::GitSubprocessFailed(format!("for-each-ref: {e}")))?;
        if !output.status.success() {
            return Err(ConvertError::GitSubprocessFailed(format!("for-each-ref exited with {}", output.status)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).lines().map(str::to_string).collect())
    }

    pub fn show(&self, options: &[&str]) -> Result<String> {
        let mut args = vec!["show"];
        args.extend_from_slice(options);
        let child = self.spawn(&args, &GitEnv::default(), Stdio::null(), Stdio::piped())?;
        let output = child.wait_with_output().map_err(|e| ConvertError::GitSubprocessFailed(format!("show: {e}")))?;
        if !output.status.success() {
            return Err(ConvertError::GitSubprocessFailed(format!("show exited with {}", output.status)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    pub fn queue_update_ref(&self, refname: impl Into<String>, target: ObjectHash) {
        self.pending_ref_updates.lock().unwrap().push((refname.into(), target));
    }

    pub fn queue_delete_ref(&self, refname: impl Into<String>) {
        self.pending_ref_deletes.lock().unwrap().push(refname.into());
    }

    /// Flushes queued ref updates through `update-ref --stdin` in two
    /// transactions — deletions, then updates — so a newly created ref can
    /// take the place of a directory of refs that's being deleted (§4.10,
    /// §5 ordering guarantees).
    pub fn commit_refs_update(&self) -> Result<()> {
        let mut deletes = self.pending_ref_deletes.lock().unwrap();
        let mut updates = self.pending_ref_updates.lock().unwrap();
        if deletes.is_empty() && updates.is_empty() {
            return Ok(());
        }

        let mut child = self.spawn(&["update-ref", "--stdin"], &GitEnv::default(), Stdio::piped(), Stdio::null())?;
        {
            let mut stdin = child.stdin.take().expect("piped stdin");
            let write = |stdin: &mut std::process::ChildStdin, line: String| -> std::io::Result<()> { stdin.write_all(line.as_bytes()) };

            (|| -> std::io::Result<()> {
                if !deletes.is_empty() {
                    write(&mut stdin, "start\n".to_string())?;
                    for refname in deletes.iter() {
                        write(&mut stdin, format!("delete \"{refname}\"\n"))?;
                    }
                    write(&mut stdin, "commit\n".to_string())?;
                }
                write(&mut stdin, "start\n".to_string())?;
                for (refname, sha1) in updates.iter() {
                    write(&mut stdin, format!("update \"{refname}\" {sha1}\n"))?;
                }
                write(&mut stdin, "commit\n".to_string())
            })()
            .map_err(|e| ConvertError::GitSubprocessFailed(format!("update-ref batch: {e}")))?;
        }
        Self::wait_ok(child, "update-ref")?;

        deletes.clear();
        updates.clear();
        debug!("flushed ref update batch");
        Ok(())
    }

    pub fn total_hashed_files(&self) -> u64 {
        self.total_hashed_files.load(Ordering::Relaxed)
    }

    pub fn total_hashed_bytes(&self) -> u64 {
        self.total_hashed_bytes.load(Ordering::Relaxed)
    }

    pub fn total_commits_made(&self) -> u64 {
        self.total_commits_made.load(Ordering::Relaxed)
    }

    pub fn log_stats(&self) {
        warn!(
            hashed_files = self.total_hashed_files(),
            hashed_mib = self.total_hashed_bytes() / 0x100000,
            commits = self.total_commits_made(),
            "git driver summary"
        );
    }
}

/// An in-flight `update-index --index-info` stream. Lines must follow
/// `<mode> <sha1> 0\t<path>\n`, or `000000 0{40} 0\t<path>\n` for a delete.
pub struct UpdateIndexSession {
    child: Child,
}

impl UpdateIndexSession {
    pub fn add(&mut self, mode: u32, hash: ObjectHash, path: &str) -> Result<()> {
        let line = format!("{mode:06o} {hash} 0\t{path}\n");
        self.write_line(&line)
    }

    pub fn delete(&mut self, path: &str) -> Result<()> {
        let line = format!("000000 {} 0\t{path}\n", ObjectHash::zero_str());
        self.write_line(&line)
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        self.child
            .stdin
            .as_mut()
            .expect("piped stdin")
            .write_all(line.as_bytes())
            .map_err(|e| ConvertError::GitSubprocessFailed(format!("update-index stdin: {e}")))
    }

    pub fn finish(mut self) -> Result<()> {
        drop(self.child.stdin.take());
        GitDriver::wait_ok(self.child, "update-index")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_env_for_workdir_sets_both() {
        let env = GitEnv::for_workdir("/tmp/work", "/tmp/work/.git.index5");
        assert_eq!(env.work_tree.as_deref(), Some(Path::new("/tmp/work")));
        assert_eq!(env.index_file.as_deref(), Some(Path::new("/tmp/work/.git.index5")));
    }

    #[test]
    fn test_driver_starts_with_zeroed_counters() {
        let driver = GitDriver::new("/tmp/repo");
        assert_eq!(driver.total_hashed_files(), 0);
        assert_eq!(driver.total_commits_made(), 0);
    }
}
