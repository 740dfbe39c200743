//! Pipeline folder store.
//!
//! Every unit of work is a single file. Where that file lives is the only record of how far it
//! has got: intake folders hold new work, `Processing/<source>` holds work a worker has claimed,
//! and the terminal folders hold finished work. All transitions are `std::fs::rename` calls
//! within the store root, so they are atomic on a single volume.

use crate::{
    io_context, FilesError, FilesResult, CLAIMS_DIR_NAME, EXTERNAL_CLAIMS_DIR_NAME,
    FAILED_DIR_NAME, GENERATED_DIR_NAME, IMPORT_DIR_NAME, SENT_DIR_NAME, UNSENT_DIR_NAME,
    UPLOADED_DIR_NAME, WORK_DIR_NAME,
};
use chrono::Utc;
use relay_types::ArtifactName;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// A named folder in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Folder {
    Work,
    Import,
    Uploaded,
    Failed,
    Generated,
    Sent,
    Unsent,
}

impl Folder {
    pub const ALL: [Folder; 7] = [
        Folder::Work,
        Folder::Import,
        Folder::Uploaded,
        Folder::Failed,
        Folder::Generated,
        Folder::Sent,
        Folder::Unsent,
    ];

    /// The on-disk directory name.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Folder::Work => WORK_DIR_NAME,
            Folder::Import => IMPORT_DIR_NAME,
            Folder::Uploaded => UPLOADED_DIR_NAME,
            Folder::Failed => FAILED_DIR_NAME,
            Folder::Generated => GENERATED_DIR_NAME,
            Folder::Sent => SENT_DIR_NAME,
            Folder::Unsent => UNSENT_DIR_NAME,
        }
    }

    /// Whether a unit in this folder is finished and will not be picked up again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Folder::Uploaded | Folder::Failed | Folder::Sent | Folder::Unsent
        )
    }

    fn from_dir_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.dir_name() == name)
    }
}

impl std::fmt::Display for Folder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Where a claimed unit came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimSource {
    /// One of the store's own intake folders.
    Folder(Folder),
    /// A path outside the store, handed in by a manual single-file operation.
    External(PathBuf),
}

/// A unit of work held exclusively by one worker.
///
/// The unit is deliberately not `Clone`: [`PipelineStore::place`] consumes it, so a claimed unit
/// can reach at most one terminal folder.
#[derive(Debug, PartialEq, Eq)]
pub struct ClaimedUnit {
    name: ArtifactName,
    path: PathBuf,
    source: ClaimSource,
}

impl ClaimedUnit {
    pub fn name(&self) -> &ArtifactName {
        &self.name
    }

    /// Current location inside the claim folder.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn source(&self) -> &ClaimSource {
        &self.source
    }

    /// Reads the claimed file as UTF-8 text.
    ///
    /// # Errors
    ///
    /// Returns `FilesError::Io` if the file cannot be read or is not valid UTF-8.
    pub fn read_to_string(&self) -> FilesResult<String> {
        fs::read_to_string(&self.path)
            .map_err(|e| io_context(e, format!("failed to read {}", self.path.display())))
    }
}

/// Directory-as-state store rooted at a single directory.
#[derive(Debug, Clone)]
pub struct PipelineStore {
    root: PathBuf,
}

impl PipelineStore {
    /// Opens the store at `root`, creating the directory if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `FilesError::InvalidRootDirectory` if `root` exists but is not a directory, or
    /// cannot be created.
    pub fn new(root: &Path) -> FilesResult<Self> {
        if root.exists() && !root.is_dir() {
            return Err(FilesError::InvalidRootDirectory(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        fs::create_dir_all(root).map_err(|e| {
            FilesError::InvalidRootDirectory(format!("{}: {}", root.display(), e))
        })?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of `folder`. The folder may not exist yet.
    pub fn folder_path(&self, folder: Folder) -> PathBuf {
        self.root.join(folder.dir_name())
    }

    fn claims_path(&self) -> PathBuf {
        self.root.join(CLAIMS_DIR_NAME)
    }

    /// Creates `folder` if it is missing and returns its path.
    ///
    /// # Errors
    ///
    /// Returns `FilesError::Io` if the directory cannot be created.
    pub fn ensure(&self, folder: Folder) -> FilesResult<PathBuf> {
        let path = self.folder_path(folder);
        fs::create_dir_all(&path)
            .map_err(|e| io_context(e, format!("failed to create {}", path.display())))?;
        Ok(path)
    }

    /// Lists the names of the units currently in `folder`.
    ///
    /// Only regular files are returned; hidden files (including in-progress staging files) and
    /// subdirectories are skipped. When `extension` is given only names with that extension
    /// (case-insensitive) are returned. Names are sorted so batches visit files in a stable
    /// order. A missing folder lists as empty.
    ///
    /// # Errors
    ///
    /// Returns `FilesError::Io` if the folder exists but cannot be read.
    pub fn list(&self, folder: Folder, extension: Option<&str>) -> FilesResult<Vec<ArtifactName>> {
        list_dir(&self.folder_path(folder), extension)
    }

    /// Number of units in `folder`.
    pub fn count(&self, folder: Folder) -> FilesResult<usize> {
        Ok(self.list(folder, None)?.len())
    }

    /// Claims the unit `name` in `folder` by renaming it into `Processing/<folder>`.
    ///
    /// # Returns
    ///
    /// `Ok(None)` when the file is no longer in `folder`, which means another worker claimed it
    /// first. This is not an error. A stale claim with the same name never blocks the unit: the
    /// new claim gets a timestamp-suffixed file while [`ClaimedUnit::name`] keeps the original.
    ///
    /// # Errors
    ///
    /// Returns `FilesError::Io` if the rename fails for any reason other than the file being gone.
    pub fn claim(&self, folder: Folder, name: &ArtifactName) -> FilesResult<Option<ClaimedUnit>> {
        let from = self.folder_path(folder).join(name.as_str());
        let claim_dir = self.claims_path().join(folder.dir_name());
        let claimed = self.claim_into(&from, &claim_dir, name, ClaimSource::Folder(folder))?;
        if claimed.is_none() {
            tracing::debug!(folder = %folder, name = %name, "already claimed by another worker");
        }
        Ok(claimed)
    }

    /// Claims a file outside the store for a manual single-file operation.
    ///
    /// The file is moved into `Processing/External`. If it lives on another volume it is copied
    /// and the original removed.
    ///
    /// # Errors
    ///
    /// Returns `FilesError::InvalidName` if `path` has no usable file name, and the same errors
    /// as [`PipelineStore::claim`] otherwise.
    pub fn claim_path(&self, path: &Path) -> FilesResult<Option<ClaimedUnit>> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let name = ArtifactName::new(file_name)?;
        let claim_dir = self.claims_path().join(EXTERNAL_CLAIMS_DIR_NAME);
        self.claim_into(path, &claim_dir, &name, ClaimSource::External(path.to_path_buf()))
    }

    fn claim_into(
        &self,
        from: &Path,
        claim_dir: &Path,
        name: &ArtifactName,
        source: ClaimSource,
    ) -> FilesResult<Option<ClaimedUnit>> {
        fs::create_dir_all(claim_dir)
            .map_err(|e| io_context(e, format!("failed to create {}", claim_dir.display())))?;
        let to = unique_destination(claim_dir, name);
        let held = to != claim_dir.join(name.as_str());

        match move_file(from, &to) {
            Ok(()) if held => {
                tracing::warn!(
                    name = %name,
                    claim = %to.display(),
                    "a stale claim holds this name, claimed under a new one"
                );
            }
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_context(e, format!("failed to claim {}", from.display()))),
        }
        Ok(Some(ClaimedUnit {
            name: name.clone(),
            path: to,
            source,
        }))
    }

    /// Moves a claimed unit into `destination`, which is created on demand.
    ///
    /// This is the commit point of a unit of work. If a file with the same name already exists
    /// in `destination`, the unit is stored under a timestamp-suffixed name instead so nothing is
    /// overwritten.
    ///
    /// # Returns
    ///
    /// The final path of the unit.
    ///
    /// # Errors
    ///
    /// Returns `FilesError::Io` if the destination cannot be created or the rename fails. The
    /// unit then stays in the claim folder and is returned to its source by
    /// [`PipelineStore::recover_claims`].
    pub fn place(&self, unit: ClaimedUnit, destination: Folder) -> FilesResult<PathBuf> {
        let dir = self.ensure(destination)?;
        let to = unique_destination(&dir, &unit.name);
        fs::rename(&unit.path, &to).map_err(|e| {
            io_context(
                e,
                format!("failed to move {} to {}", unit.path.display(), to.display()),
            )
        })?;
        tracing::info!(name = %unit.name, folder = %destination, "unit placed");
        Ok(to)
    }

    /// Returns every orphaned claim to the folder it was claimed from.
    ///
    /// Intended for startup, before any worker runs: a claim left behind by a crashed worker is
    /// put back into its intake folder so the next batch sees it again. Claims taken from outside
    /// the store are returned to `Import`.
    ///
    /// # Returns
    ///
    /// The number of units recovered.
    ///
    /// # Errors
    ///
    /// Returns `FilesError::Io` if a claim folder cannot be read or a rename fails.
    pub fn recover_claims(&self) -> FilesResult<usize> {
        let claims = self.claims_path();
        if !claims.is_dir() {
            return Ok(0);
        }

        let mut recovered = 0;
        let entries = fs::read_dir(&claims)
            .map_err(|e| io_context(e, format!("failed to read {}", claims.display())))?;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir_name = entry.file_name();
            let dir_name = dir_name.to_string_lossy();
            let target = if dir_name == EXTERNAL_CLAIMS_DIR_NAME {
                Folder::Import
            } else if let Some(folder) = Folder::from_dir_name(&dir_name) {
                folder
            } else {
                tracing::warn!(dir = %dir_name, "skipping unknown claim folder");
                continue;
            };

            let target_dir = self.ensure(target)?;
            for name in list_dir(&entry.path(), None)? {
                let from = entry.path().join(name.as_str());
                let to = unique_destination(&target_dir, &name);
                fs::rename(&from, &to)
                    .map_err(|e| io_context(e, format!("failed to recover {}", from.display())))?;
                tracing::warn!(name = %name, folder = %target, "recovered orphaned claim");
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Writes a new unit into `folder`.
    ///
    /// The contents are written to a hidden temporary file in the same folder and renamed into
    /// place, so a concurrent [`PipelineStore::list`] never sees a partial file. A name clash
    /// gets a timestamp suffix.
    ///
    /// # Returns
    ///
    /// The final path of the new unit.
    ///
    /// # Errors
    ///
    /// Returns `FilesError::Io` if writing or renaming fails.
    pub fn stage(
        &self,
        folder: Folder,
        name: &ArtifactName,
        contents: &[u8],
    ) -> FilesResult<PathBuf> {
        let dir = self.ensure(folder)?;
        let tmp = dir.join(format!(".{}.tmp", name));
        write_synced(&tmp, contents)?;
        let to = unique_destination(&dir, name);
        fs::rename(&tmp, &to)
            .map_err(|e| io_context(e, format!("failed to stage {}", to.display())))?;
        tracing::debug!(name = %name, folder = %folder, "unit staged");
        Ok(to)
    }
}

/// Writes `contents` to `path` and flushes it to disk.
pub(crate) fn write_synced(path: &Path, contents: &[u8]) -> FilesResult<()> {
    let mut file = fs::File::create(path)
        .map_err(|e| io_context(e, format!("failed to create {}", path.display())))?;
    file.write_all(contents)
        .map_err(|e| io_context(e, format!("failed to write {}", path.display())))?;
    file.sync_all()?;
    Ok(())
}

fn list_dir(dir: &Path, extension: Option<&str>) -> FilesResult<Vec<ArtifactName>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_context(e, format!("failed to read {}", dir.display()))),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Some(file_name) = entry.file_name().to_str().map(str::to_owned) else {
            tracing::warn!(path = %entry.path().display(), "skipping non UTF-8 file name");
            continue;
        };
        if file_name.starts_with('.') {
            continue;
        }
        let name = match ArtifactName::new(&file_name) {
            Ok(name) => name,
            Err(e) => {
                tracing::warn!(path = %entry.path().display(), error = %e, "skipping unusable file name");
                continue;
            }
        };
        let wanted = match extension {
            Some(ext) => name
                .extension()
                .is_some_and(|e| e.eq_ignore_ascii_case(ext)),
            None => true,
        };
        if wanted {
            names.push(name);
        }
    }
    names.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    Ok(names)
}

/// Picks a path in `dir` for `name` that does not exist yet.
fn unique_destination(dir: &Path, name: &ArtifactName) -> PathBuf {
    let candidate = dir.join(name.as_str());
    if !candidate.exists() {
        return candidate;
    }

    let (stem, ext) = match name.extension() {
        Some(ext) => (&name.as_str()[..name.as_str().len() - ext.len() - 1], Some(ext)),
        None => (name.as_str(), None),
    };
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
    let mut attempt = 0u32;
    loop {
        let suffix = if attempt == 0 {
            stamp.to_string()
        } else {
            format!("{}-{}", stamp, attempt)
        };
        let file_name = match ext {
            Some(ext) => format!("{}-{}.{}", stem, suffix, ext),
            None => format!("{}-{}", stem, suffix),
        };
        let candidate = dir.join(file_name);
        if !candidate.exists() {
            return candidate;
        }
        attempt += 1;
    }
}

/// Renames `from` to `to`, falling back to copy and remove across volumes.
fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(e),
        Err(rename_err) => {
            if !from.is_file() {
                return Err(rename_err);
            }
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}
