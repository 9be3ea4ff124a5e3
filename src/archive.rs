use std::fs::{self, File, Permissions};
use std::path::{Component, Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{RbError, Result};

/// Declarative edit applied to the structured manifest inside an archive.
///
/// Paths are lists of mapping keys starting at the document root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ManifestMutation {
    /// Overwrite every string-valued field directly under `path` with `value`.
    OverwriteStrings { path: Vec<String>, value: String },
    /// Insert or replace keys of the mapping at `path`.
    MergeMapping {
        path: Vec<String>,
        entries: Map<String, Value>,
    },
    /// Append `entry` to the list stored under the last key of `path`,
    /// creating the list when the key is absent.
    AppendToList { path: Vec<String>, entry: Value },
    /// Replace the manifest verbatim with the contents of another file.
    ReplaceWith { source: PathBuf },
}

/// Rewrites one manifest inside a tar.gz artifact and repacks the tree.
#[derive(Debug, Clone, Default)]
pub struct ArchiveTransformer {
    scratch_root: Option<PathBuf>,
}

/// Archive ready for upload. Scratch space is released on drop.
#[derive(Debug)]
pub struct StagedArchive {
    path: PathBuf,
    scratch: Option<TempDir>,
}

impl StagedArchive {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_rewritten(&self) -> bool {
        self.scratch.is_some()
    }
}

impl ArchiveTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place extraction directories under `root` instead of the system temp dir.
    pub fn with_scratch_root(root: impl Into<PathBuf>) -> Self {
        Self {
            scratch_root: Some(root.into()),
        }
    }

    /// Extract `source`, apply `mutations` to `manifest` and recompress.
    ///
    /// Writes to `destination` when given, otherwise replaces `source` in place.
    /// Every entry other than the manifest is repacked byte-for-byte.
    pub fn transform(
        &self,
        source: &Path,
        manifest: &Path,
        mutations: &[ManifestMutation],
        destination: Option<&Path>,
    ) -> Result<PathBuf> {
        if !source.is_file() {
            return Err(RbError::ArtifactNotFound(source.to_path_buf()));
        }

        let workdir = self.scratch_dir("rb-archive-")?;
        info!(
            "decompressing {} to {}",
            source.display(),
            workdir.path().display()
        );
        unpack(source, workdir.path())?;

        let manifest_path = locate_manifest(workdir.path(), manifest)?;

        if apply_mutations(&manifest_path, mutations)? {
            info!("rewrote manifest {}", manifest.display());
        } else {
            debug!("manifest {} left untouched", manifest.display());
        }

        let permissions = fs::metadata(source)?.permissions();
        let target = destination.unwrap_or(source);
        pack(workdir.path(), target, permissions)?;
        info!(
            "{} compression completed ({})",
            target.display(),
            archive_digest(target)?
        );
        Ok(target.to_path_buf())
    }

    /// Produce an upload-ready copy of `source` without touching the original.
    ///
    /// With no mutations the source itself is handed out.
    pub fn stage(
        &self,
        source: &Path,
        manifest: &Path,
        mutations: &[ManifestMutation],
    ) -> Result<StagedArchive> {
        if !source.is_file() {
            return Err(RbError::ArtifactNotFound(source.to_path_buf()));
        }
        if mutations.is_empty() {
            return Ok(StagedArchive {
                path: source.to_path_buf(),
                scratch: None,
            });
        }

        let scratch = self.scratch_dir("rb-staged-")?;
        let file_name = source
            .file_name()
            .ok_or_else(|| RbError::ArtifactNotFound(source.to_path_buf()))?;
        let staged = scratch.path().join(file_name);
        self.transform(source, manifest, mutations, Some(&staged))?;
        Ok(StagedArchive {
            path: staged,
            scratch: Some(scratch),
        })
    }

    fn scratch_dir(&self, prefix: &str) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix);
        let dir = match &self.scratch_root {
            Some(root) => {
                fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        Ok(dir)
    }
}

/// `sha256:<hex>` digest of an archive on disk.
pub fn archive_digest(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let _ = std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("sha256:{:x}", hasher.finalize()))
}

fn unpack(source: &Path, dest: &Path) -> Result<()> {
    let file = File::open(source)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive.unpack(dest).map_err(|err| {
        RbError::Compression(format!("failed to extract {}: {err}", source.display()))
    })
}

/// Resolve `manifest` inside an extracted tree.
///
/// The entry must be a regular file whose real location stays under `root`;
/// absolute paths, `..` components and links pointing out of the tree are
/// reported as missing.
fn locate_manifest(root: &Path, manifest: &Path) -> Result<PathBuf> {
    let missing = |detail: &str| {
        RbError::ManifestMissing(format!("{} ({detail})", manifest.display()))
    };
    if manifest
        .components()
        .any(|part| !matches!(part, Component::Normal(_) | Component::CurDir))
    {
        return Err(missing("path must stay inside the archive"));
    }

    let root = root
        .canonicalize()
        .map_err(|err| RbError::Compression(format!("{}: {err}", root.display())))?;
    let resolved = match root.join(manifest).canonicalize() {
        Ok(path) => path,
        Err(_) => return Err(missing("no such entry")),
    };
    if !resolved.starts_with(&root) {
        return Err(missing("entry links outside the archive"));
    }
    if !resolved.is_file() {
        return Err(missing("not a regular file"));
    }
    Ok(resolved)
}

fn pack(root: &Path, target: &Path, permissions: Permissions) -> Result<()> {
    let parent = match target.parent() {
        Some(dir) if dir != Path::new("") => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;

    let compression_err =
        |err: std::io::Error| RbError::Compression(format!("{}: {err}", target.display()));

    let staging = NamedTempFile::new_in(&parent).map_err(compression_err)?;
    let mut builder = tar::Builder::new(GzEncoder::new(staging, Compression::default()));
    // Links are stored as links; their targets may not exist or may live outside the tree.
    builder.follow_symlinks(false);
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|err| RbError::Compression(err.to_string()))?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|err| RbError::Compression(format!("invalid relative path: {err}")))?;
        if entry.file_type().is_dir() {
            builder
                .append_dir(rel, entry.path())
                .map_err(compression_err)?;
        } else {
            builder
                .append_path_with_name(entry.path(), rel)
                .map_err(compression_err)?;
        }
    }

    let encoder = builder.into_inner().map_err(compression_err)?;
    let staging = encoder.finish().map_err(compression_err)?;
    staging
        .as_file()
        .set_permissions(permissions)
        .map_err(compression_err)?;
    staging
        .persist(target)
        .map_err(|err| RbError::Compression(format!("{}: {}", target.display(), err.error)))?;
    Ok(())
}

/// Returns whether the manifest on disk was rewritten.
fn apply_mutations(manifest: &Path, mutations: &[ManifestMutation]) -> Result<bool> {
    if mutations.is_empty() {
        return Ok(false);
    }

    let mut contents = fs::read_to_string(manifest)?;
    let mut document: Option<Value> = None;
    let mut structured_change = false;
    let mut replaced = false;

    for mutation in mutations {
        if let ManifestMutation::ReplaceWith { source } = mutation {
            if !source.is_file() {
                return Err(RbError::ArtifactNotFound(source.clone()));
            }
            contents = fs::read_to_string(source)?;
            document = None;
            structured_change = false;
            replaced = true;
            continue;
        }

        if document.is_none() {
            document = Some(parse_manifest(&contents)?);
        }
        if let Some(doc) = document.as_mut() {
            let before = doc.clone();
            apply_structured(doc, mutation)?;
            if *doc != before {
                structured_change = true;
            }
        }
    }

    if structured_change && let Some(doc) = document.as_ref() {
        contents = serde_yaml_bw::to_string(doc)
            .map_err(|err| RbError::Yaml(format!("failed to serialize manifest: {err}")))?;
    }

    let changed = structured_change || replaced;
    if changed {
        fs::write(manifest, contents)?;
    }
    Ok(changed)
}

fn parse_manifest(contents: &str) -> Result<Value> {
    serde_yaml_bw::from_str(contents)
        .map_err(|err| RbError::Yaml(format!("failed to parse manifest: {err}")))
}

fn apply_structured(doc: &mut Value, mutation: &ManifestMutation) -> Result<()> {
    match mutation {
        ManifestMutation::OverwriteStrings { path, value } => {
            let node = mapping_at(doc, path)?;
            for field in node.values_mut() {
                if field.is_string() {
                    *field = Value::String(value.clone());
                }
            }
        }
        ManifestMutation::MergeMapping { path, entries } => {
            let node = mapping_at(doc, path)?;
            for (key, value) in entries {
                node.insert(key.clone(), value.clone());
            }
        }
        ManifestMutation::AppendToList { path, entry } => {
            let Some((key, parent_path)) = path.split_last() else {
                return Err(RbError::Validation(
                    "append_to_list requires a non-empty path".into(),
                ));
            };
            let parent = mapping_at(doc, parent_path)?;
            let list = parent
                .entry(key.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            match list.as_array_mut() {
                Some(items) => items.push(entry.clone()),
                None => {
                    return Err(RbError::Yaml(format!(
                        "manifest node '{}' is not a list",
                        path.join(".")
                    )));
                }
            }
        }
        ManifestMutation::ReplaceWith { .. } => {}
    }
    Ok(())
}

fn mapping_at<'a>(doc: &'a mut Value, path: &[String]) -> Result<&'a mut Map<String, Value>> {
    let mut current = doc;
    for (depth, key) in path.iter().enumerate() {
        current = current.get_mut(key.as_str()).ok_or_else(|| {
            RbError::Yaml(format!("manifest has no node '{}'", path[..=depth].join(".")))
        })?;
    }
    current.as_object_mut().ok_or_else(|| {
        RbError::Yaml(format!(
            "manifest node '{}' is not a mapping",
            if path.is_empty() {
                "<root>".to_string()
            } else {
                path.join(".")
            }
        ))
    })
}
