//! Dependency modules a target can offer to the host.

use std::{
    fs,
    io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use tracing::debug;

/// A module the target knows about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    /// Module name.
    pub module_name: String,
    /// Location of the module on the target.
    pub module_location: String,
    /// Last modification time.
    pub modification_time: DateTime<Utc>,
}

/// Source of the dependency modules offered during synchronisation.
pub trait ModuleCatalog: Send + Sync + 'static {
    /// Every module currently available.
    ///
    /// # Errors
    /// Returns an I/O error if the catalog cannot be listed.
    fn modules(&self) -> io::Result<Vec<CatalogEntry>>;

    /// Read the image of `entry`.
    ///
    /// # Errors
    /// Returns an I/O error if the image cannot be read.
    fn read_image(&self, entry: &CatalogEntry) -> io::Result<Vec<u8>>;
}

/// A catalog with no modules.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyCatalog;

impl ModuleCatalog for EmptyCatalog {
    fn modules(&self) -> io::Result<Vec<CatalogEntry>> { Ok(Vec::new()) }

    fn read_image(&self, entry: &CatalogEntry) -> io::Result<Vec<u8>> {
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is not in the catalog", entry.module_name),
        ))
    }
}

/// Offers every regular file in one directory (not recursive) as a module.
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    root: PathBuf,
}

impl DirectoryCatalog {
    /// Catalog the files directly inside `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self { Self { root: root.into() } }

    /// Directory being catalogued.
    #[must_use]
    pub fn root(&self) -> &Path { &self.root }
}

impl ModuleCatalog for DirectoryCatalog {
    fn modules(&self) -> io::Result<Vec<CatalogEntry>> {
        let mut entries = Vec::new();
        for item in fs::read_dir(&self.root)? {
            let dir_entry = item?;
            let metadata = dir_entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let path = dir_entry.path();
            let Some(module_name) = path.file_stem().and_then(|s| s.to_str()) else {
                debug!(path = %path.display(), "skipping module with a non-UTF-8 name");
                continue;
            };
            entries.push(CatalogEntry {
                module_name: module_name.to_owned(),
                module_location: path.display().to_string(),
                modification_time: DateTime::<Utc>::from(metadata.modified()?),
            });
        }
        entries.sort_by(|a, b| a.module_location.cmp(&b.module_location));
        Ok(entries)
    }

    fn read_image(&self, entry: &CatalogEntry) -> io::Result<Vec<u8>> { fs::read(&entry.module_location) }
}
