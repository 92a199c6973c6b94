use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

use crate::{
    process::{diagnostic_output, run_command},
    run::{supervise, SuperviseSpec},
    SupervisorError,
};

/// Marker file that protects a kept sandbox tree from retention sweeps.
pub const KEEP_MARKER: &str = ".patrol-keep";

/// A target repository as resolved from the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoSource {
    pub name: String,
    pub language: String,
    pub local_path: Option<PathBuf>,
    pub remote: Option<String>,
    pub commit: Option<String>,
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("no usable sandbox storage under `{root}`: {source}")]
    StorageSetupFailure {
        root: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("repo `{name}` resolves to neither a local copy nor a reachable remote{detail}")]
    RepoUnavailable { name: String, detail: String },
    #[error("sandbox tmp root `{tmp_root}` is nested under the indexed path `{indexed}`")]
    TmpRootInsideWorkspace { tmp_root: PathBuf, indexed: PathBuf },
    #[error("failed to copy `{path}` into the sandbox: {source}")]
    CopyTree {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("indexer install failed in `{workspace}`: {detail}")]
    InstallFailed { workspace: PathBuf, detail: String },
    #[error("failed to package the indexer from `{workspace}`: {detail}")]
    PackFailed { workspace: PathBuf, detail: String },
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

/// An isolated workspace for exactly one supervised run.
#[derive(Debug)]
pub struct Sandbox {
    pub tmp_root: PathBuf,
    pub workspace: PathBuf,
    pub indexer_bin: PathBuf,
    pub bootstrap_ok: bool,
    pub bootstrap_tail: String,
    keep: bool,
}

impl Sandbox {
    /// Marks the sandbox for preservation; teardown then writes the keep
    /// marker instead of deleting the tree.
    pub fn mark_keep(&mut self) {
        self.keep = true;
    }

    pub fn kept(&self) -> bool {
        self.keep
    }

    /// Destroys the tree, or protects it when `keep` was requested.
    pub fn teardown(self) -> io::Result<TeardownOutcome> {
        if self.keep {
            fs::write(self.tmp_root.join(KEEP_MARKER), b"")?;
            return Ok(TeardownOutcome::Kept(self.tmp_root));
        }
        fs::remove_dir_all(&self.tmp_root)?;
        Ok(TeardownOutcome::Destroyed)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum TeardownOutcome {
    Destroyed,
    Kept(PathBuf),
}

/// Options for provisioning one sandbox.
pub struct ProvisionRequest<'a> {
    pub repo: &'a RepoSource,
    pub tarball: &'a Path,
    pub tmp_parent: &'a Path,
    pub cheap_model_env: &'a BTreeMap<String, String>,
    pub interactive: bool,
    pub install_timeout: Duration,
    pub bootstrap_timeout: Duration,
    pub bootstrap_stall_timeout: Duration,
    pub mirror_output: bool,
}

/// The shared sandbox parent on the same volume as the source workspace but
/// outside its indexed path.
pub fn default_tmp_parent(source_workspace: &Path) -> PathBuf {
    source_workspace
        .parent()
        .unwrap_or(source_workspace)
        .join(".patrol-tmp")
}

/// Materializes an isolated workspace copy of `repo` with the indexer
/// installed from the packaged tarball and bootstrapped in fast mode.
/// Bootstrap failure is recorded, not fatal: the agent meets the same state.
pub async fn provision(request: ProvisionRequest<'_>) -> Result<Sandbox, SandboxError> {
    let repo = request.repo;
    if let Some(local) = &repo.local_path {
        if request.tmp_parent.starts_with(local) {
            return Err(SandboxError::TmpRootInsideWorkspace {
                tmp_root: request.tmp_parent.to_path_buf(),
                indexed: local.clone(),
            });
        }
    }

    let tmp_root = allocate_tmp_root(request.tmp_parent, &repo.name)?;
    let workspace = tmp_root.join("workspace");

    pause(request.interactive, "materialize workspace");
    materialize_workspace(repo, &workspace).await?;

    synthesize_manifest(&workspace, &repo.name)
        .map_err(|source| SandboxError::StorageSetupFailure {
            root: workspace.clone(),
            source,
        })?;

    pause(request.interactive, "install indexer");
    install_indexer(&workspace, request.tarball, request.install_timeout).await?;
    let indexer_bin = workspace.join("node_modules").join(".bin").join("indexer");

    pause(request.interactive, "bootstrap indexer");
    let (bootstrap_ok, bootstrap_tail) = bootstrap_indexer(
        &workspace,
        &indexer_bin,
        request.cheap_model_env,
        request.bootstrap_timeout,
        request.bootstrap_stall_timeout,
        request.mirror_output,
    )
    .await?;
    if !bootstrap_ok {
        warn!(repo = %repo.name, "indexer bootstrap failed; recorded, not fatal");
    }

    Ok(Sandbox {
        tmp_root,
        workspace,
        indexer_bin,
        bootstrap_ok,
        bootstrap_tail,
        keep: false,
    })
}

/// Packages the indexer once per invocation; every provisioner consumes the
/// same tarball.
pub async fn pack_indexer(
    source_workspace: &Path,
    destination: &Path,
) -> Result<PathBuf, SandboxError> {
    fs::create_dir_all(destination).map_err(|source| SandboxError::StorageSetupFailure {
        root: destination.to_path_buf(),
        source,
    })?;
    let mut command = Command::new("npm");
    command
        .arg("pack")
        .arg("--pack-destination")
        .arg(destination)
        .current_dir(source_workspace);
    let output = run_command(command, Path::new("npm"), Some(Duration::from_secs(120))).await?;
    if !output.status.success() {
        return Err(SandboxError::PackFailed {
            workspace: source_workspace.to_path_buf(),
            detail: diagnostic_output(&output),
        });
    }
    let name = String::from_utf8_lossy(&output.stdout)
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| l.ends_with(".tgz"))
        .map(str::to_string)
        .ok_or_else(|| SandboxError::PackFailed {
            workspace: source_workspace.to_path_buf(),
            detail: "npm pack reported no tarball name".to_string(),
        })?;
    Ok(destination.join(name))
}

fn allocate_tmp_root(tmp_parent: &Path, repo_name: &str) -> Result<PathBuf, SandboxError> {
    let storage_err = |root: &Path, source: io::Error| SandboxError::StorageSetupFailure {
        root: root.to_path_buf(),
        source,
    };
    fs::create_dir_all(tmp_parent).map_err(|e| storage_err(tmp_parent, e))?;

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let tmp_root = tmp_parent.join(format!(
        "sandbox-{}-{}-{}",
        sanitize(repo_name),
        std::process::id(),
        nanos
    ));
    fs::create_dir(&tmp_root).map_err(|e| storage_err(&tmp_root, e))?;

    // Cheap write probe so a full volume fails here rather than mid-copy.
    let probe = tmp_root.join(".space-probe");
    fs::write(&probe, b"probe").map_err(|e| storage_err(&tmp_root, e))?;
    let _ = fs::remove_file(&probe);

    Ok(tmp_root)
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

async fn materialize_workspace(repo: &RepoSource, workspace: &Path) -> Result<(), SandboxError> {
    if let Some(local) = &repo.local_path {
        if local.is_dir() {
            copy_tree(local, workspace)?;
            return Ok(());
        }
    }

    let Some(remote) = &repo.remote else {
        return Err(SandboxError::RepoUnavailable {
            name: repo.name.clone(),
            detail: String::new(),
        });
    };

    let mut command = Command::new("git");
    command
        .arg("clone")
        .arg("--depth")
        .arg("1")
        .arg(remote)
        .arg(workspace);
    let output = run_command(command, Path::new("git"), Some(Duration::from_secs(300))).await?;
    if !output.status.success() {
        return Err(SandboxError::RepoUnavailable {
            name: repo.name.clone(),
            detail: format!(": {}", diagnostic_output(&output)),
        });
    }

    if let Some(commit) = &repo.commit {
        let mut command = Command::new("git");
        command.arg("-C").arg(workspace).arg("checkout").arg(commit);
        let output = run_command(command, Path::new("git"), Some(Duration::from_secs(60))).await?;
        if !output.status.success() {
            // A shallow clone may not contain the pinned commit.
            info!(
                repo = %repo.name,
                commit,
                "pinned commit unavailable in shallow clone; staying on clone head"
            );
        }
    }
    Ok(())
}

/// Copies a repo tree, skipping dependency and sandbox directories and
/// symlinks. Errors name the path that failed.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<(), SandboxError> {
    const SKIP: [&str; 3] = ["node_modules", ".patrol-tmp", "target"];
    let copy_err = |path: &Path, source: io::Error| SandboxError::CopyTree {
        path: path.to_path_buf(),
        source,
    };

    fs::create_dir_all(dst).map_err(|e| copy_err(dst, e))?;
    for entry in fs::read_dir(src).map_err(|e| copy_err(src, e))? {
        let entry = entry.map_err(|e| copy_err(src, e))?;
        let name = entry.file_name();
        if SKIP.iter().any(|s| name == *s) {
            continue;
        }
        let src_path = entry.path();
        let dst_path = dst.join(&name);
        let file_type = entry.file_type().map_err(|e| copy_err(&src_path, e))?;
        if file_type.is_symlink() {
            continue;
        }
        if file_type.is_dir() {
            copy_tree(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path).map_err(|e| copy_err(&src_path, e))?;
        }
    }
    Ok(())
}

/// Writes a minimal manifest when the target repo ships none, so the indexer
/// tarball has something to install into.
fn synthesize_manifest(workspace: &Path, repo_name: &str) -> io::Result<()> {
    let manifest = workspace.join("package.json");
    if manifest.exists() {
        return Ok(());
    }
    let body = serde_json::json!({
        "name": format!("{}-patrol-sandbox", sanitize(repo_name)),
        "version": "0.0.0",
        "private": true,
    });
    fs::write(manifest, serde_json::to_vec_pretty(&body)?)
}

async fn install_indexer(
    workspace: &Path,
    tarball: &Path,
    timeout: Duration,
) -> Result<(), SandboxError> {
    let mut command = Command::new("npm");
    command
        .arg("install")
        .arg("--no-audit")
        .arg("--no-fund")
        .arg(tarball)
        .current_dir(workspace);
    let output = run_command(command, Path::new("npm"), Some(timeout)).await?;
    if !output.status.success() {
        return Err(SandboxError::InstallFailed {
            workspace: workspace.to_path_buf(),
            detail: diagnostic_output(&output),
        });
    }
    Ok(())
}

async fn bootstrap_indexer(
    workspace: &Path,
    indexer_bin: &Path,
    cheap_model_env: &BTreeMap<String, String>,
    timeout: Duration,
    stall_timeout: Duration,
    mirror_output: bool,
) -> Result<(bool, String), SandboxError> {
    let mut env = cheap_model_env.clone();
    env.insert("CI".to_string(), "1".to_string());

    let mut spec = SuperviseSpec::new(indexer_bin, workspace)
        .args(["bootstrap", "--mode", "fast", "--yes"])
        .wall_clock(timeout)
        .stall_timeout(stall_timeout)
        .label("indexer-bootstrap");
    spec.env = env;
    spec.mirror_output = mirror_output;

    let outcome = supervise(spec).await?;
    let ok = outcome.exit_code == Some(0)
        && outcome.termination == crate::TerminationReason::Normal;
    let combined = format!("{}\n{}", outcome.stdout, outcome.stderr);
    let tail: String = combined
        .chars()
        .rev()
        .take(2000)
        .collect::<String>()
        .chars()
        .rev()
        .collect();
    Ok((ok, tail))
}

fn pause(interactive: bool, stage: &str) {
    if !interactive {
        return;
    }
    eprintln!("[patrol] next stage: {stage} (press Enter to continue)");
    let mut line = String::new();
    let _ = io::stdin().read_line(&mut line);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tmp_parent_is_a_sibling_of_the_workspace() {
        let parent = default_tmp_parent(Path::new("/srv/work/indexer"));
        assert_eq!(parent, PathBuf::from("/srv/work/.patrol-tmp"));
        assert!(!parent.starts_with("/srv/work/indexer"));
    }

    #[tokio::test]
    async fn repo_without_local_or_remote_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let repo = RepoSource {
            name: "ghost".to_string(),
            language: "ts".to_string(),
            local_path: None,
            remote: None,
            commit: None,
        };
        let err = materialize_workspace(&repo, &dir.path().join("ws"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::RepoUnavailable { .. }));
    }

    #[tokio::test]
    async fn tmp_root_under_indexed_path_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("repo");
        fs::create_dir_all(&local).unwrap();
        let repo = RepoSource {
            name: "self".to_string(),
            language: "ts".to_string(),
            local_path: Some(local.clone()),
            remote: None,
            commit: None,
        };
        let env = BTreeMap::new();
        let nested = local.join(".patrol-tmp");
        let request = ProvisionRequest {
            repo: &repo,
            tarball: Path::new("/nonexistent.tgz"),
            tmp_parent: &nested,
            cheap_model_env: &env,
            interactive: false,
            install_timeout: Duration::from_secs(1),
            bootstrap_timeout: Duration::from_secs(1),
            bootstrap_stall_timeout: Duration::from_secs(1),
            mirror_output: false,
        };
        let err = provision(request).await.unwrap_err();
        assert!(matches!(err, SandboxError::TmpRootInsideWorkspace { .. }));
    }

    #[test]
    fn copy_tree_skips_dependency_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("lib")).unwrap();
        fs::create_dir_all(src.join("node_modules/dep")).unwrap();
        fs::write(src.join("lib/a.ts"), "export {}").unwrap();
        fs::write(src.join("node_modules/dep/x.js"), "skip").unwrap();

        let dst = dir.path().join("dst");
        copy_tree(&src, &dst).unwrap();
        assert!(dst.join("lib/a.ts").is_file());
        assert!(!dst.join("node_modules").exists());
    }

    #[test]
    fn manifest_synthesized_only_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        synthesize_manifest(dir.path(), "demo repo").unwrap();
        let body = fs::read_to_string(dir.path().join("package.json")).unwrap();
        assert!(body.contains("demo-repo-patrol-sandbox"));

        fs::write(dir.path().join("package.json"), "{\"name\":\"orig\"}").unwrap();
        synthesize_manifest(dir.path(), "demo repo").unwrap();
        let body = fs::read_to_string(dir.path().join("package.json")).unwrap();
        assert_eq!(body, "{\"name\":\"orig\"}");
    }

    #[test]
    fn teardown_keep_writes_marker() {
        let dir = tempfile::tempdir().unwrap();
        let tmp_root = dir.path().join("sb");
        fs::create_dir_all(&tmp_root).unwrap();
        let mut sandbox = Sandbox {
            tmp_root: tmp_root.clone(),
            workspace: tmp_root.join("workspace"),
            indexer_bin: tmp_root.join("bin"),
            bootstrap_ok: true,
            bootstrap_tail: String::new(),
            keep: false,
        };
        sandbox.mark_keep();
        let outcome = sandbox.teardown().unwrap();
        assert_eq!(outcome, TeardownOutcome::Kept(tmp_root.clone()));
        assert!(tmp_root.join(KEEP_MARKER).is_file());
    }

    #[test]
    fn teardown_without_keep_destroys_the_tree() {
        let dir = tempfile::tempdir().unwrap();
        let tmp_root = dir.path().join("sb");
        fs::create_dir_all(tmp_root.join("workspace")).unwrap();
        let sandbox = Sandbox {
            tmp_root: tmp_root.clone(),
            workspace: tmp_root.join("workspace"),
            indexer_bin: tmp_root.join("bin"),
            bootstrap_ok: false,
            bootstrap_tail: String::new(),
            keep: false,
        };
        assert_eq!(sandbox.teardown().unwrap(), TeardownOutcome::Destroyed);
        assert!(!tmp_root.exists());
    }
}
