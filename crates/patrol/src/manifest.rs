use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use supervisor::RepoSource;
use thiserror::Error;

use crate::config::{mode_defaults, Mode};

/// The target-repo manifest: `{ "repos": [ { name, language, remote?, commit? } ] }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub repos: Vec<ManifestRepo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestRepo {
    pub name: String,
    pub language: String,
    #[serde(default)]
    pub remote: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse manifest `{path}`: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("manifest `{path}` lists no repos")]
    Empty { path: PathBuf },
    #[error("repo `{name}` is not in the manifest")]
    UnknownRepo { name: String },
}

pub fn load_manifest(path: &Path) -> Result<Manifest, ManifestError> {
    let bytes = fs::read(path).map_err(|source| ManifestError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let manifest: Manifest =
        serde_json::from_slice(&bytes).map_err(|source| ManifestError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    if manifest.repos.is_empty() {
        return Err(ManifestError::Empty {
            path: path.to_path_buf(),
        });
    }
    Ok(manifest)
}

/// Resolves a manifest entry against the manifest root: a directory named
/// after the repo becomes its local copy, otherwise the remote is used.
pub fn resolve_repo(manifest_root: &Path, repo: &ManifestRepo) -> RepoSource {
    let candidate = manifest_root.join(&repo.name);
    RepoSource {
        name: repo.name.clone(),
        language: repo.language.clone(),
        local_path: candidate.is_dir().then_some(candidate),
        remote: repo.remote.clone(),
        commit: repo.commit.clone(),
    }
}

/// Selects the repos for this invocation.
///
/// `quick` shuffles; `full`/`release` use a deterministic
/// language-diversity-weighted rotation (one repo per language, languages in
/// sorted order, manifest order within a language) so consecutive invocations
/// cover the same set in the same order.
pub fn select_repos<'a>(
    manifest: &'a Manifest,
    mode: Mode,
    only: Option<&str>,
    max_repos: Option<usize>,
    rng: &mut impl Rng,
) -> Result<Vec<&'a ManifestRepo>, ManifestError> {
    if let Some(name) = only {
        let repo = manifest
            .repos
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| ManifestError::UnknownRepo {
                name: name.to_string(),
            })?;
        return Ok(vec![repo]);
    }

    let count = max_repos
        .unwrap_or(mode_defaults(mode).repo_count)
        .min(manifest.repos.len())
        .max(1);

    match mode {
        Mode::Quick => {
            let mut shuffled: Vec<&ManifestRepo> = manifest.repos.iter().collect();
            shuffled.shuffle(rng);
            shuffled.truncate(count);
            Ok(shuffled)
        }
        Mode::Full | Mode::Release => Ok(language_rotation(manifest, count)),
    }
}

fn language_rotation(manifest: &Manifest, count: usize) -> Vec<&ManifestRepo> {
    let mut by_language: BTreeMap<&str, Vec<&ManifestRepo>> = BTreeMap::new();
    for repo in &manifest.repos {
        by_language.entry(repo.language.as_str()).or_default().push(repo);
    }

    let mut selected = Vec::with_capacity(count);
    let mut round = 0usize;
    while selected.len() < count {
        let mut took_any = false;
        for repos in by_language.values() {
            if let Some(repo) = repos.get(round) {
                selected.push(*repo);
                took_any = true;
                if selected.len() == count {
                    break;
                }
            }
        }
        if !took_any {
            break;
        }
        round += 1;
    }
    selected
}
