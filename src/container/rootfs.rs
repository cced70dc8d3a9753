//! Per-job root filesystems.
//!
//! Layers are unpacked in manifest order into `<scratch>/<job id>/root`. Whiteout
//! entries remove paths contributed by lower layers: `.wh.<name>` deletes `<name>`,
//! `.wh..wh..opq` empties the directory it sits in. Directory modes are applied only
//! after every layer is in place so read-only directories don't block later writes.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use tar::{Archive, EntryType};

use crate::layer::LayerCache;
use crate::scheduler::JobId;
use crate::spec::{JobMount, JobSpec, LayerManifest};
use crate::worker::ExecutionError;

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Scratch directory of one job. Removed when dropped.
#[derive(Debug)]
pub struct JobDir {
    path: PathBuf,
    root: PathBuf,
    removed: bool,
}

impl JobDir {
    pub fn create(scratch_dir: &Path, job_id: JobId) -> io::Result<Self> {
        fs::create_dir_all(scratch_dir)?;
        let path = scratch_dir.join(job_id.to_string());
        if path.exists() {
            remove_tree(&path)?;
        }
        fs::create_dir(&path)?;
        let root = path.join("root");
        fs::create_dir(&root)?;
        Ok(Self {
            path,
            root,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Remove the directory off the async runtime.
    pub async fn remove(mut self) -> io::Result<()> {
        self.removed = true;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || remove_tree(&path))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }
}

impl Drop for JobDir {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = remove_tree(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove job directory");
        }
    }
}

/// Directory modes from the layers, keyed by path below the root and applied once
/// unpacking is finished.
#[derive(Debug, Default)]
struct DirModes(BTreeMap<PathBuf, u32>);

impl DirModes {
    fn apply(self, root: &Path) -> io::Result<()> {
        let mut dirs: Vec<(PathBuf, u32)> = self.0.into_iter().collect();
        // Children first: a parent without search permission blocks chmod below it.
        dirs.sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));
        for (relative, mode) in dirs {
            let Some((parent, name)) = split(&relative) else {
                continue;
            };
            // A later layer may have replaced the directory or a parent with a symlink.
            let Ok(Some(parent)) = find_dir(root, parent) else {
                continue;
            };
            let path = parent.join(name);
            match fs::symlink_metadata(&path) {
                Ok(meta) if meta.is_dir() => {
                    fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Unpack `manifest` into `root` and create the mount points `spec` needs.
pub async fn assemble(
    root: &Path,
    manifest: &LayerManifest,
    layers: &LayerCache,
    spec: &JobSpec,
) -> Result<(), ExecutionError> {
    let mut modes = DirModes::default();

    for digest in manifest.iter() {
        let data = layers
            .get(digest)
            .await
            .map_err(|e| ExecutionError::setup("rootfs", e.to_string()))?;
        let root = root.to_path_buf();
        let short = digest.short();
        modes = tokio::task::spawn_blocking(move || {
            unpack_layer(&root, &data, &mut modes).map(|()| modes)
        })
        .await
        .map_err(|e| ExecutionError::Internal(e.to_string()))?
        .map_err(|e| ExecutionError::setup("rootfs", format!("layer {short}: {e}")))?;
    }

    let root = root.to_path_buf();
    let mounts = spec.mounts.clone();
    tokio::task::spawn_blocking(move || {
        let root = fs::canonicalize(&root)?;
        prepare_mount_points(&root, &mounts)?;
        modes.apply(&root)
    })
    .await
    .map_err(|e| ExecutionError::Internal(e.to_string()))?
    .map_err(|e| ExecutionError::setup("rootfs", e.to_string()))
}

fn unpack_layer(root: &Path, data: &[u8], modes: &mut DirModes) -> io::Result<()> {
    let root = &fs::canonicalize(root)?;

    // Whiteouts only hide lower layers, so they run before this layer's own entries.
    for entry in Archive::new(data).entries()? {
        let entry = entry?;
        let path = entry.path()?.into_owned();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with(WHITEOUT_PREFIX) {
            continue;
        }
        let Some(parent) = contained(path.parent().unwrap_or(Path::new(""))) else {
            continue;
        };
        let Some(dir) = find_dir(root, &parent)? else {
            continue;
        };
        if name == OPAQUE_WHITEOUT {
            clear_dir(&dir)?;
        } else {
            let hidden = &name[WHITEOUT_PREFIX.len()..];
            if !hidden.is_empty() && hidden != "." && hidden != ".." {
                remove_path(&dir.join(hidden))?;
            }
        }
    }

    for entry in Archive::new(data).entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(WHITEOUT_PREFIX))
        {
            continue;
        }
        let Some(relative) = contained(&path) else {
            continue;
        };
        let Some((parent, name)) = split(&relative) else {
            continue;
        };
        let dest = make_dir(root, parent)?.join(name);

        if entry.header().entry_type() == EntryType::Directory {
            match fs::symlink_metadata(&dest) {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => {
                    fs::remove_file(&dest)?;
                    fs::create_dir(&dest)?;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir(&dest)?,
                Err(e) => return Err(e),
            }
            let mode = entry.header().mode().unwrap_or(0o755) & 0o7777;
            modes.0.insert(relative, mode);
            continue;
        }

        remove_path(&dest)?;
        entry.set_preserve_permissions(true);
        entry.set_unpack_xattrs(false);
        entry.unpack_in(root)?;
    }
    Ok(())
}

/// `root` must be canonical.
fn prepare_mount_points(root: &Path, mounts: &[JobMount]) -> io::Result<()> {
    for mount in mounts {
        let Some(relative) = contained(Path::new(mount.target())) else {
            continue;
        };
        let Some((parent, name)) = split(&relative) else {
            continue;
        };
        let dest = make_dir(root, parent)?.join(name);
        let wants_file = match mount {
            JobMount::Bind { source, .. } => !fs::metadata(source)?.is_dir(),
            JobMount::Tmp { .. } | JobMount::Proc { .. } => false,
        };

        match fs::symlink_metadata(&dest) {
            Ok(meta) if meta.file_type().is_symlink() => fs::remove_file(&dest)?,
            Ok(meta) if meta.is_dir() != wants_file => continue,
            Ok(_) => remove_path(&dest)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        if wants_file {
            fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&dest)?;
        } else {
            fs::create_dir(&dest)?;
        }
    }
    Ok(())
}

/// Parent directory and final name of a non-empty relative path.
fn split(relative: &Path) -> Option<(&Path, &OsStr)> {
    let name = relative.file_name()?;
    Some((relative.parent().unwrap_or(Path::new("")), name))
}

/// The real directory `relative` names under `root`, or `None` if part of it is missing.
fn find_dir(root: &Path, relative: &Path) -> io::Result<Option<PathBuf>> {
    walk(root, relative, false)
}

/// Like [`find_dir`], creating missing directories on the way.
fn make_dir(root: &Path, relative: &Path) -> io::Result<PathBuf> {
    walk(root, relative, true)?.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("cannot create {}", relative.display()),
        )
    })
}

/// Resolve `relative` under the canonical `root` one component at a time. Symlinks
/// left by earlier layers are followed only while they resolve inside `root`.
fn walk(root: &Path, relative: &Path, create: bool) -> io::Result<Option<PathBuf>> {
    let mut dir = root.to_path_buf();
    for component in relative.components() {
        let Component::Normal(part) = component else {
            continue;
        };
        let next = dir.join(part);
        match fs::symlink_metadata(&next) {
            Ok(meta) if meta.file_type().is_symlink() => {
                let target = match fs::canonicalize(&next) {
                    Ok(target) => target,
                    Err(e) if e.kind() == io::ErrorKind::NotFound && !create => return Ok(None),
                    Err(e) => return Err(e),
                };
                if !target.starts_with(root) {
                    return Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        format!("{} leads outside the root filesystem", next.display()),
                    ));
                }
                if !target.is_dir() {
                    return not_a_directory(&next, create);
                }
                dir = target;
            }
            Ok(meta) if meta.is_dir() => dir = next,
            Ok(_) => return not_a_directory(&next, create),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if !create {
                    return Ok(None);
                }
                fs::create_dir(&next)?;
                dir = next;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(Some(dir))
}

fn not_a_directory(path: &Path, create: bool) -> io::Result<Option<PathBuf>> {
    if !create {
        return Ok(None);
    }
    Err(io::Error::new(
        io::ErrorKind::Other,
        format!("{} is not a directory", path.display()),
    ))
}

/// `path` as a relative path that cannot leave the root it is joined to. The root
/// itself is the empty path.
fn contained(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

fn clear_dir(dir: &Path) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        remove_path(&entry?.path())?;
    }
    Ok(())
}

fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => remove_tree(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// `remove_dir_all`, first granting ourselves write access to read-only directories.
pub(crate) fn remove_tree(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            make_writable(path)?;
            fs::remove_dir_all(path)
        }
        Err(e) => Err(e),
    }
}

fn make_writable(dir: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(dir)?;
    if !meta.is_dir() {
        return Ok(());
    }
    let mode = meta.permissions().mode();
    fs::set_permissions(dir, fs::Permissions::from_mode(mode | 0o700))?;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            make_writable(&entry.path())?;
        }
    }
    Ok(())
}
