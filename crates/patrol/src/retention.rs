use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::EnvSnapshot;
use crate::report::{now_rfc3339, tree_size};
use supervisor::KEEP_MARKER;

#[derive(Debug, Parser)]
pub struct Args {
    /// Workspace root whose transient artifacts are swept.
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Which artifact roots to consider.
    #[arg(long, value_enum, default_value_t = RetentionContext::Auto)]
    pub context: RetentionContext,

    /// Plan only; delete nothing.
    #[arg(long)]
    pub dry_run: bool,

    /// Write the audit document here.
    #[arg(long)]
    pub audit_out: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RetentionContext {
    Auto,
    Repo,
    Installed,
}

/// The named artifact classes the engine manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ArtifactClass {
    ReleaseEvidence,
    PatrolReports,
    Sandboxes,
    Packages,
    ExternalClones,
}

impl ArtifactClass {
    pub const ALL: [ArtifactClass; 5] = [
        ArtifactClass::ReleaseEvidence,
        ArtifactClass::PatrolReports,
        ArtifactClass::Sandboxes,
        ArtifactClass::Packages,
        ArtifactClass::ExternalClones,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactClass::ReleaseEvidence => "releaseEvidence",
            ArtifactClass::PatrolReports => "patrolReports",
            ArtifactClass::Sandboxes => "sandboxes",
            ArtifactClass::Packages => "packages",
            ArtifactClass::ExternalClones => "externalClones",
        }
    }

    /// Transient classes count against the total storage cap.
    pub fn transient(self) -> bool {
        matches!(
            self,
            ArtifactClass::Sandboxes | ArtifactClass::Packages | ArtifactClass::ExternalClones
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassLimits {
    pub max_age: Option<Duration>,
    pub max_count: Option<usize>,
    pub min_delete_age: Option<Duration>,
    pub protected: bool,
}

const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(24 * 3600);

pub fn default_limits(class: ArtifactClass, env: &EnvSnapshot) -> ClassLimits {
    match class {
        ArtifactClass::ReleaseEvidence => ClassLimits {
            max_age: None,
            max_count: None,
            min_delete_age: None,
            protected: true,
        },
        ArtifactClass::PatrolReports => ClassLimits {
            max_age: Some(30 * DAY),
            max_count: Some(50),
            min_delete_age: None,
            protected: false,
        },
        ArtifactClass::Sandboxes => ClassLimits {
            max_age: Some(
                env.storage_cap_age_hours
                    .map_or(24 * HOUR, |h| Duration::from_secs(h * 3600)),
            ),
            max_count: Some(env.storage_cap_entries.unwrap_or(16)),
            min_delete_age: Some(HOUR),
            protected: false,
        },
        ArtifactClass::Packages => ClassLimits {
            max_age: Some(7 * DAY),
            max_count: Some(5),
            min_delete_age: None,
            protected: false,
        },
        ArtifactClass::ExternalClones => ClassLimits {
            max_age: Some(72 * HOUR),
            max_count: None,
            min_delete_age: Some(6 * HOUR),
            protected: false,
        },
    }
}

/// Workspace overrides (`.patrol/retention.json`). Overrides may tighten
/// limits; unprotecting a protected class is a validation error.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RetentionOverrides {
    pub classes: BTreeMap<String, ClassOverride>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClassOverride {
    pub max_age_hours: Option<u64>,
    pub max_count: Option<usize>,
    pub min_delete_age_hours: Option<u64>,
    pub protected: Option<bool>,
}

#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("invalid retention override: class `{class}` is protected and cannot be unprotected")]
    ConfigInvalid { class: String },
    #[error("failed to read retention overrides `{path}`: {source}")]
    OverridesRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse retention overrides `{path}`: {source}")]
    OverridesParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write retention audit `{path}`: {source}")]
    AuditWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub fn overrides_path(workspace: &Path) -> PathBuf {
    workspace.join(".patrol").join("retention.json")
}

pub fn load_overrides(workspace: &Path) -> Result<RetentionOverrides, RetentionError> {
    let path = overrides_path(workspace);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            return Ok(RetentionOverrides::default())
        }
        Err(source) => return Err(RetentionError::OverridesRead { path, source }),
    };
    serde_json::from_slice(&bytes).map_err(|source| RetentionError::OverridesParse { path, source })
}

/// Applies an override onto the class defaults. A protected class can never
/// be downgraded; protecting an unprotected class is allowed (tighten-only).
pub fn resolve_limits(
    class: ArtifactClass,
    defaults: ClassLimits,
    class_override: Option<&ClassOverride>,
) -> Result<ClassLimits, RetentionError> {
    let Some(class_override) = class_override else {
        return Ok(defaults);
    };
    let mut limits = defaults;
    if let Some(protected) = class_override.protected {
        if defaults.protected && !protected {
            return Err(RetentionError::ConfigInvalid {
                class: class.as_str().to_string(),
            });
        }
        limits.protected = protected;
    }
    if let Some(hours) = class_override.max_age_hours {
        limits.max_age = Some(Duration::from_secs(hours * 3600));
    }
    if let Some(count) = class_override.max_count {
        limits.max_count = Some(count);
    }
    if let Some(hours) = class_override.min_delete_age_hours {
        limits.min_delete_age = Some(Duration::from_secs(hours * 3600));
    }
    Ok(limits)
}

/// One deletable unit: a direct child (file or tree) of a class root.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub path: PathBuf,
    pub modified: SystemTime,
    pub bytes: u64,
    pub keep_marker: bool,
}

pub fn class_roots(
    workspace: &Path,
    class: ArtifactClass,
    context: RetentionContext,
) -> Vec<PathBuf> {
    let dot = workspace.join(".patrol");
    match class {
        ArtifactClass::ReleaseEvidence => vec![dot.join("evidence")],
        ArtifactClass::PatrolReports => vec![dot.join("reports")],
        ArtifactClass::Sandboxes => vec![supervisor::default_tmp_parent(workspace)],
        ArtifactClass::Packages => vec![dot.join("packages")],
        ArtifactClass::ExternalClones => match context {
            RetentionContext::Repo => vec![dot.join("clones")],
            RetentionContext::Installed => vec![dot.join("external")],
            RetentionContext::Auto => vec![dot.join("clones"), dot.join("external")],
        },
    }
}

pub fn collect_candidates(roots: &[PathBuf]) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    for root in roots {
        let Ok(read) = fs::read_dir(root) else {
            continue;
        };
        for entry in read.flatten() {
            let path = entry.path();
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let (bytes, keep_marker) = if meta.is_dir() {
                (tree_size(&path).0, path.join(KEEP_MARKER).is_file())
            } else {
                (meta.len(), false)
            };
            candidates.push(Candidate {
                path,
                modified,
                bytes,
                keep_marker,
            });
        }
    }
    candidates
}

#[derive(Debug, Default)]
pub struct SelectionPlan {
    pub delete: Vec<Candidate>,
    pub kept: Vec<Candidate>,
}

/// The selection algorithm: newest first; delete when age strictly exceeds
/// `maxAge` or position exceeds `maxCount`, unless guarded by `minDeleteAge`;
/// protected classes and keep-marked artifacts are never deleted.
pub fn select_deletions(
    mut candidates: Vec<Candidate>,
    limits: &ClassLimits,
    now: SystemTime,
) -> SelectionPlan {
    let mut plan = SelectionPlan::default();
    if limits.protected {
        plan.kept = candidates;
        return plan;
    }

    candidates.sort_by(|a, b| b.modified.cmp(&a.modified));
    for (position, candidate) in candidates.into_iter().enumerate() {
        if candidate.keep_marker {
            plan.kept.push(candidate);
            continue;
        }
        let age = now
            .duration_since(candidate.modified)
            .unwrap_or(Duration::ZERO);
        let guarded = limits.min_delete_age.is_some_and(|guard| age <= guard);
        let over_age = limits.max_age.is_some_and(|max| age > max);
        let over_count = limits.max_count.is_some_and(|max| position >= max);
        if (over_age || over_count) && !guarded {
            plan.delete.push(candidate);
        } else {
            plan.kept.push(candidate);
        }
    }
    plan
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassAudit {
    pub class: ArtifactClass,
    pub protected: bool,
    pub candidates: usize,
    pub kept: usize,
    pub planned: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
    pub before_bytes: u64,
    pub after_bytes: u64,
    pub deleted_bytes: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionAudit {
    pub kind: String,
    pub created_at: String,
    pub workspace: PathBuf,
    pub dry_run: bool,
    pub classes: Vec<ClassAudit>,
    pub total_deleted_bytes: u64,
}

pub const AUDIT_KIND: &str = "RetentionAudit.v1";

/// Resolves limits (failing closed on invalid overrides before any work),
/// plans per-class deletions, applies the total storage cap to transient
/// classes, then executes and audits.
pub fn run(args: &Args, env: &EnvSnapshot) -> Result<RetentionAudit, RetentionError> {
    let overrides = load_overrides(&args.workspace)?;

    let mut limits = BTreeMap::new();
    for class in ArtifactClass::ALL {
        let resolved = resolve_limits(
            class,
            default_limits(class, env),
            overrides.classes.get(class.as_str()),
        )?;
        limits.insert(class, resolved);
    }

    let now = SystemTime::now();
    let mut plans: BTreeMap<ArtifactClass, SelectionPlan> = BTreeMap::new();
    for class in ArtifactClass::ALL {
        let roots = class_roots(&args.workspace, class, args.context);
        let candidates = collect_candidates(&roots);
        plans.insert(class, select_deletions(candidates, &limits[&class], now));
    }
    apply_total_cap(&mut plans, env.storage_cap_total);

    let mut classes = Vec::new();
    let mut total_deleted_bytes = 0u64;
    for class in ArtifactClass::ALL {
        let plan = &plans[&class];
        let before_bytes: u64 = plan
            .delete
            .iter()
            .chain(plan.kept.iter())
            .map(|c| c.bytes)
            .sum();

        let mut deleted = Vec::new();
        let mut deleted_bytes = 0u64;
        if !args.dry_run {
            for candidate in &plan.delete {
                match remove_artifact(&candidate.path) {
                    Ok(()) => {
                        deleted_bytes += candidate.bytes;
                        deleted.push(candidate.path.clone());
                    }
                    Err(error) => {
                        warn!(path = %candidate.path.display(), %error, "failed to delete artifact");
                    }
                }
            }
        }
        total_deleted_bytes += deleted_bytes;

        classes.push(ClassAudit {
            class,
            protected: limits[&class].protected,
            candidates: plan.delete.len() + plan.kept.len(),
            kept: plan.kept.len(),
            planned: plan.delete.iter().map(|c| c.path.clone()).collect(),
            deleted,
            before_bytes,
            after_bytes: before_bytes - deleted_bytes,
            deleted_bytes,
        });
    }

    let audit = RetentionAudit {
        kind: AUDIT_KIND.to_string(),
        created_at: now_rfc3339(),
        workspace: args.workspace.clone(),
        dry_run: args.dry_run,
        classes,
        total_deleted_bytes,
    };

    if let Some(path) = &args.audit_out {
        write_audit(path, &audit)?;
    }
    info!(
        dry_run = args.dry_run,
        total_deleted_bytes, "retention sweep complete"
    );
    Ok(audit)
}

/// Second pass: when the kept transient artifacts still exceed the total
/// cap, move the oldest unguarded ones into the delete plan until under it.
fn apply_total_cap(plans: &mut BTreeMap<ArtifactClass, SelectionPlan>, cap: Option<u64>) {
    let Some(cap) = cap else { return };
    let mut kept_total: u64 = ArtifactClass::ALL
        .iter()
        .filter(|c| c.transient())
        .flat_map(|c| plans[c].kept.iter())
        .map(|c| c.bytes)
        .sum();
    if kept_total <= cap {
        return;
    }

    // Oldest first across all transient classes.
    let mut order: Vec<(ArtifactClass, SystemTime, PathBuf)> = ArtifactClass::ALL
        .into_iter()
        .filter(|c| c.transient())
        .flat_map(|class| {
            plans[&class]
                .kept
                .iter()
                .filter(|c| !c.keep_marker)
                .map(move |c| (class, c.modified, c.path.clone()))
        })
        .collect();
    order.sort_by(|a, b| a.1.cmp(&b.1));

    for (class, _, path) in order {
        if kept_total <= cap {
            break;
        }
        let Some(plan) = plans.get_mut(&class) else {
            continue;
        };
        if let Some(index) = plan.kept.iter().position(|c| c.path == path) {
            let candidate = plan.kept.remove(index);
            kept_total = kept_total.saturating_sub(candidate.bytes);
            plan.delete.push(candidate);
        }
    }
}

fn remove_artifact(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

fn write_audit(path: &Path, audit: &RetentionAudit) -> Result<(), RetentionError> {
    let write_err = |source: io::Error| RetentionError::AuditWrite {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    let body = serde_json::to_vec_pretty(audit).map_err(|e| write_err(io::Error::other(e)))?;
    fs::write(path, body).map_err(write_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(name: &str, age: Duration, bytes: u64, now: SystemTime) -> Candidate {
        Candidate {
            path: PathBuf::from(name),
            modified: now - age,
            bytes,
            keep_marker: false,
        }
    }

    fn unprotected(
        max_age: Option<Duration>,
        max_count: Option<usize>,
        min_delete_age: Option<Duration>,
    ) -> ClassLimits {
        ClassLimits {
            max_age,
            max_count,
            min_delete_age,
            protected: false,
        }
    }

    #[test]
    fn candidate_at_exactly_max_age_is_kept() {
        let now = SystemTime::now();
        let limits = unprotected(Some(HOUR), None, None);
        let at_limit = candidate("at-limit", HOUR, 10, now);
        let over = candidate("over", HOUR + Duration::from_secs(1), 10, now);
        let plan = select_deletions(vec![at_limit, over], &limits, now);
        assert_eq!(plan.delete.len(), 1);
        assert_eq!(plan.delete[0].path, PathBuf::from("over"));
    }

    #[test]
    fn min_delete_age_guards_old_candidates() {
        let now = SystemTime::now();
        let limits = unprotected(Some(HOUR), None, Some(3 * HOUR));
        let plan = select_deletions(vec![candidate("young", 2 * HOUR, 10, now)], &limits, now);
        assert!(plan.delete.is_empty());
    }

    #[test]
    fn position_beyond_max_count_is_deleted() {
        let now = SystemTime::now();
        let limits = unprotected(None, Some(2), None);
        let candidates = vec![
            candidate("newest", Duration::from_secs(10), 1, now),
            candidate("middle", Duration::from_secs(20), 1, now),
            candidate("oldest", Duration::from_secs(30), 1, now),
        ];
        let plan = select_deletions(candidates, &limits, now);
        assert_eq!(plan.delete.len(), 1);
        assert_eq!(plan.delete[0].path, PathBuf::from("oldest"));
    }

    #[test]
    fn protected_class_deletes_nothing() {
        let now = SystemTime::now();
        let limits = ClassLimits {
            max_age: Some(Duration::ZERO),
            max_count: Some(0),
            min_delete_age: None,
            protected: true,
        };
        let plan = select_deletions(
            vec![candidate("ancient", 9999 * HOUR, 10, now)],
            &limits,
            now,
        );
        assert!(plan.delete.is_empty());
        assert_eq!(plan.kept.len(), 1);
    }

    #[test]
    fn keep_marker_wins_over_every_limit() {
        let now = SystemTime::now();
        let limits = unprotected(Some(Duration::ZERO), Some(0), None);
        let mut marked = candidate("kept-sandbox", 9999 * HOUR, 10, now);
        marked.keep_marker = true;
        let plan = select_deletions(vec![marked], &limits, now);
        assert!(plan.delete.is_empty());
    }

    #[test]
    fn unprotecting_release_evidence_is_config_invalid() {
        let env = EnvSnapshot::default();
        let defaults = default_limits(ArtifactClass::ReleaseEvidence, &env);
        let class_override = ClassOverride {
            protected: Some(false),
            ..ClassOverride::default()
        };
        let err = resolve_limits(
            ArtifactClass::ReleaseEvidence,
            defaults,
            Some(&class_override),
        )
        .unwrap_err();
        assert!(matches!(err, RetentionError::ConfigInvalid { .. }));
    }

    #[test]
    fn overrides_may_tighten() {
        let env = EnvSnapshot::default();
        let defaults = default_limits(ArtifactClass::Sandboxes, &env);
        let class_override = ClassOverride {
            max_age_hours: Some(2),
            max_count: Some(3),
            protected: Some(true),
            ..ClassOverride::default()
        };
        let limits =
            resolve_limits(ArtifactClass::Sandboxes, defaults, Some(&class_override)).unwrap();
        assert_eq!(limits.max_age, Some(2 * HOUR));
        assert_eq!(limits.max_count, Some(3));
        assert!(limits.protected);
    }

    #[test]
    fn env_caps_feed_sandbox_defaults() {
        let env = EnvSnapshot {
            storage_cap_age_hours: Some(6),
            storage_cap_entries: Some(4),
            ..EnvSnapshot::default()
        };
        let limits = default_limits(ArtifactClass::Sandboxes, &env);
        assert_eq!(limits.max_age, Some(6 * HOUR));
        assert_eq!(limits.max_count, Some(4));
    }

    #[test]
    fn invalid_override_aborts_before_any_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("ws");
        let reports = workspace.join(".patrol").join("reports");
        fs::create_dir_all(&reports).unwrap();
        fs::write(reports.join("r.json"), b"{}").unwrap();
        fs::create_dir_all(workspace.join(".patrol")).unwrap();
        fs::write(
            overrides_path(&workspace),
            b"{\"classes\":{\"releaseEvidence\":{\"protected\":false}}}",
        )
        .unwrap();

        let args = Args {
            workspace: workspace.clone(),
            context: RetentionContext::Repo,
            dry_run: false,
            audit_out: Some(dir.path().join("audit.json")),
        };
        let err = run(&args, &EnvSnapshot::default()).unwrap_err();
        assert!(matches!(err, RetentionError::ConfigInvalid { .. }));
        assert!(reports.join("r.json").is_file(), "nothing deleted");
        assert!(!dir.path().join("audit.json").exists(), "audit not written");
    }

    #[test]
    fn sweep_deletes_and_accounts_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("ws");
        let packages = workspace.join(".patrol").join("packages");
        fs::create_dir_all(&packages).unwrap();
        for i in 0..7 {
            fs::write(packages.join(format!("indexer-{i}.tgz")), vec![b'x'; 100]).unwrap();
        }

        let args = Args {
            workspace: workspace.clone(),
            context: RetentionContext::Repo,
            dry_run: false,
            audit_out: Some(dir.path().join("audit.json")),
        };
        let audit = run(&args, &EnvSnapshot::default()).unwrap();
        let packages_audit = audit
            .classes
            .iter()
            .find(|c| c.class == ArtifactClass::Packages)
            .unwrap();
        // Packages keeps at most 5.
        assert_eq!(packages_audit.deleted.len(), 2);
        assert_eq!(
            packages_audit.deleted_bytes,
            packages_audit.before_bytes - packages_audit.after_bytes
        );
        assert_eq!(packages_audit.deleted_bytes, 200);
        assert!(dir.path().join("audit.json").is_file());
    }

    #[test]
    fn dry_run_plans_but_deletes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("ws");
        let packages = workspace.join(".patrol").join("packages");
        fs::create_dir_all(&packages).unwrap();
        for i in 0..7 {
            fs::write(packages.join(format!("indexer-{i}.tgz")), b"x").unwrap();
        }

        let args = Args {
            workspace,
            context: RetentionContext::Repo,
            dry_run: true,
            audit_out: None,
        };
        let audit = run(&args, &EnvSnapshot::default()).unwrap();
        let packages_audit = audit
            .classes
            .iter()
            .find(|c| c.class == ArtifactClass::Packages)
            .unwrap();
        assert_eq!(packages_audit.planned.len(), 2);
        assert!(packages_audit.deleted.is_empty());
        assert_eq!(packages_audit.before_bytes, packages_audit.after_bytes);
        assert_eq!(audit.total_deleted_bytes, 0);
    }

    #[test]
    fn total_cap_evicts_oldest_transients() {
        let now = SystemTime::now();
        let mut plans: BTreeMap<ArtifactClass, SelectionPlan> = BTreeMap::new();
        for class in ArtifactClass::ALL {
            plans.insert(class, SelectionPlan::default());
        }
        plans.get_mut(&ArtifactClass::Sandboxes).unwrap().kept = vec![
            candidate("old-sandbox", 10 * HOUR, 600, now),
            candidate("new-sandbox", HOUR, 500, now),
        ];
        apply_total_cap(&mut plans, Some(800));
        let sandboxes = &plans[&ArtifactClass::Sandboxes];
        assert_eq!(sandboxes.delete.len(), 1);
        assert_eq!(sandboxes.delete[0].path, PathBuf::from("old-sandbox"));
        assert_eq!(sandboxes.kept.len(), 1);
    }
}
