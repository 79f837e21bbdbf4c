use std::{
    collections::BTreeMap,
    fmt::Display,
    fs::{File, Permissions},
    io::{BufRead, BufReader, Read},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use flate2::read::GzDecoder;
use tokio::fs;
use walkdir::WalkDir;

use crate::{GatewayError, GatewayResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The basename prefix that marks a whiteout entry.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// The basename that hides everything below its directory in earlier layers.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A downloaded layer archive, gzipped or plain tar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerArchive {
    /// Digest of the layer blob.
    pub digest: String,

    /// Path of the archive on disk.
    pub path: PathBuf,
}

/// Whether an archive member is a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    /// A directory entry.
    Directory,

    /// Anything else, including symlinks and hard links.
    Other,
}

/// A member name as it appears in a layer archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveMember {
    /// The raw member path.
    pub path: String,

    /// The member kind.
    pub kind: MemberKind,
}

/// The members retained from one layer, keyed by normalised path.
pub type LayerPlan = BTreeMap<String, MemberKind>;

enum Whiteout {
    Entry(String),
    Opaque(String),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ArchiveMember {
    /// Creates a directory member.
    pub fn dir(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: MemberKind::Directory,
        }
    }

    /// Creates a non-directory member.
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: MemberKind::Other,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Decides which members of each layer survive once later layers are applied.
///
/// Layers are given base first. Whiteouts never appear in the result and the returned plans line
/// up with the input layers.
pub fn plan_layers(layers: &[Vec<ArchiveMember>]) -> Vec<LayerPlan> {
    let mut plans: Vec<LayerPlan> = Vec::with_capacity(layers.len());

    for members in layers {
        let mut current = LayerPlan::new();
        let mut whiteouts = Vec::new();

        for member in members {
            let Some(path) = normalize_member(&member.path) else {
                continue;
            };

            let (parent, name) = match path.rsplit_once('/') {
                Some((parent, name)) => (parent, name),
                None => ("", path.as_str()),
            };

            if name == OPAQUE_WHITEOUT {
                whiteouts.push(Whiteout::Opaque(parent.to_string()));
            } else if let Some(target) = name.strip_prefix(WHITEOUT_PREFIX) {
                whiteouts.push(Whiteout::Entry(join_member(parent, target)));
            } else {
                current.insert(path, member.kind);
            }
        }

        for earlier in plans.iter_mut() {
            for whiteout in &whiteouts {
                match whiteout {
                    Whiteout::Entry(target) => remove_tree(earlier, target),
                    Whiteout::Opaque(dir) => remove_below(earlier, dir),
                }
            }

            for (path, kind) in &current {
                match earlier.get(path) {
                    Some(MemberKind::Directory) if *kind == MemberKind::Directory => {}
                    Some(_) => remove_tree(earlier, path),
                    None => {}
                }
            }
        }

        plans.push(current);
    }

    plans
}

/// Extracts the layers, base first, into `dest` as a single merged tree.
///
/// Members hidden by whiteouts or shadowed by later layers are never written. Once every layer is
/// in place the tree is made readable by everyone and writable by its owner.
pub async fn extract_layers(layers: &[LayerArchive], dest: &Path) -> GatewayResult<()> {
    fs::create_dir_all(dest).await?;

    let layers = layers.to_vec();
    let dest = dest.to_path_buf();

    tokio::task::spawn_blocking(move || -> GatewayResult<()> {
        let listings = layers
            .iter()
            .map(list_members)
            .collect::<GatewayResult<Vec<_>>>()?;

        let plans = plan_layers(&listings);
        for (layer, plan) in layers.iter().zip(&plans) {
            tracing::debug!(digest = %layer.digest, members = plan.len(), "unpacking layer");
            unpack_layer(layer, plan, &dest)?;
        }

        normalize_permissions(&dest)
    })
    .await??;

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Strips `./` and trailing slashes, returning `None` for members that must never be written.
fn normalize_member(raw: &str) -> Option<String> {
    if raw.starts_with('/') {
        return None;
    }

    let mut path = raw;
    while let Some(rest) = path.strip_prefix("./") {
        path = rest;
    }

    let path = path.trim_end_matches('/');
    if path.is_empty() || path == "." {
        return None;
    }

    if path.split('/').any(|segment| segment == "..") {
        return None;
    }

    if path == "dev" || path.starts_with("dev/") {
        return None;
    }

    Some(path.to_string())
}

fn join_member(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

fn remove_tree(plan: &mut LayerPlan, path: &str) {
    plan.remove(path);
    remove_below(plan, path);
}

fn remove_below(plan: &mut LayerPlan, dir: &str) {
    if dir.is_empty() {
        plan.clear();
        return;
    }

    let prefix = format!("{dir}/");
    plan.retain(|member, _| !member.starts_with(&prefix));
}

fn extraction_error(layer: &LayerArchive, error: impl Display) -> GatewayError {
    GatewayError::Extraction(format!("layer {}: {error}", layer.digest))
}

fn open_archive(layer: &LayerArchive) -> GatewayResult<tar::Archive<Box<dyn Read>>> {
    let file = File::open(&layer.path).map_err(|e| extraction_error(layer, e))?;
    let mut reader = BufReader::new(file);

    let gzipped = reader
        .fill_buf()
        .map_err(|e| extraction_error(layer, e))?
        .starts_with(&GZIP_MAGIC);

    let reader: Box<dyn Read> = if gzipped {
        Box::new(GzDecoder::new(reader))
    } else {
        Box::new(reader)
    };

    Ok(tar::Archive::new(reader))
}

fn list_members(layer: &LayerArchive) -> GatewayResult<Vec<ArchiveMember>> {
    let mut archive = open_archive(layer)?;
    let mut members = Vec::new();

    for entry in archive.entries().map_err(|e| extraction_error(layer, e))? {
        let entry = entry.map_err(|e| extraction_error(layer, e))?;
        let path = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let kind = if entry.header().entry_type().is_dir() {
            MemberKind::Directory
        } else {
            MemberKind::Other
        };

        members.push(ArchiveMember { path, kind });
    }

    Ok(members)
}

fn unpack_layer(layer: &LayerArchive, plan: &LayerPlan, dest: &Path) -> GatewayResult<()> {
    let mut archive = open_archive(layer)?;
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive.set_unpack_xattrs(false);

    for entry in archive.entries().map_err(|e| extraction_error(layer, e))? {
        let mut entry = entry.map_err(|e| extraction_error(layer, e))?;
        let raw = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let Some(path) = normalize_member(&raw) else {
            continue;
        };

        if !plan.contains_key(&path) {
            continue;
        }

        let entry_type = entry.header().entry_type();
        if entry_type.is_character_special() || entry_type.is_block_special() {
            tracing::debug!(%path, "skipping device node");
            continue;
        }

        if entry_type.is_hard_link() {
            let target = entry
                .link_name()
                .map_err(|e| extraction_error(layer, e))?
                .and_then(|target| normalize_member(&target.to_string_lossy()));

            if let Some(target) = target {
                if std::fs::symlink_metadata(dest.join(&target)).is_err() {
                    tracing::warn!(%path, %target, "skipping hard link to a missing member");
                    continue;
                }
            }
        }

        entry
            .unpack_in(dest)
            .map_err(|e| extraction_error(layer, format!("{path}: {e}")))?;

        if !entry_type.is_symlink() {
            ensure_owner_writable(&dest.join(&path), entry_type.is_dir())
                .map_err(|e| extraction_error(layer, format!("{path}: {e}")))?;
        }
    }

    Ok(())
}

/// Adds `u+w`, plus `u+rx` on directories, so later layers can write over the member.
fn ensure_owner_writable(path: &Path, is_dir: bool) -> std::io::Result<()> {
    let metadata = std::fs::symlink_metadata(path)?;
    if metadata.file_type().is_symlink() {
        return Ok(());
    }

    let mode = metadata.permissions().mode() & 0o7777;
    let wanted = if is_dir { mode | 0o700 } else { mode | 0o200 };
    if wanted != mode {
        std::fs::set_permissions(path, Permissions::from_mode(wanted))?;
    }

    Ok(())
}

/// Applies `a+rX,u+w` over the whole tree, leaving symlinks alone.
fn normalize_permissions(dest: &Path) -> GatewayResult<()> {
    for entry in WalkDir::new(dest).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|e| GatewayError::Extraction(e.to_string()))?;
        if entry.path_is_symlink() {
            continue;
        }

        let metadata = entry
            .metadata()
            .map_err(|e| GatewayError::Extraction(e.to_string()))?;

        let mode = metadata.permissions().mode() & 0o7777;
        let execute = if entry.file_type().is_dir() || mode & 0o111 != 0 {
            0o111
        } else {
            0
        };

        let wanted = mode | 0o644 | execute;
        if wanted != mode {
            std::fs::set_permissions(entry.path(), Permissions::from_mode(wanted))?;
        }
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
