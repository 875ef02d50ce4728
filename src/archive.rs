//! ZIP snapshot archives.
//!
//! Layout of an archive:
//!
//! ```text
//! media/...              media root
//! requirements.txt       dependency manifest (full backups)
//! repositories.json      checked out branch and commit per repository (full backups)
//! sources/<key>.tar.gz   source tree per repository (full backups)
//! database.sql           logical database dump
//! ```

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Component, Path, PathBuf};

use derive_more::{Display, Error, From};
use walkdir::WalkDir;
use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const MEDIA_DIR: &str = "media";
pub const SOURCES_DIR: &str = "sources";
pub const MANIFEST_FILE: &str = "requirements.txt";
pub const REPOSITORIES_FILE: &str = "repositories.json";
pub const DUMP_FILE: &str = "database.sql";

#[derive(Debug, Display, Error, From)]
pub enum ArchiveError {
    #[display("archive I/O on {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[from]
    #[display("zip error: {_0}")]
    Zip(ZipError),
    /// Entry escapes the extraction directory.
    #[display("unsafe archive entry: {_0}")]
    UnsafeEntry(#[error(ignore)] String),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Appends files and directory trees to a new ZIP archive.
pub struct ArchiveWriter {
    zip: ZipWriter<File>,
    path: PathBuf,
    options: FileOptions,
    entries: Vec<String>,
}

impl ArchiveWriter {
    pub fn create(path: &Path) -> Result<Self, ArchiveError> {
        let file = File::create(path).map_err(io_err(path))?;
        Ok(Self {
            zip: ZipWriter::new(file),
            path: path.to_path_buf(),
            options: FileOptions::default().compression_method(CompressionMethod::Deflated),
            entries: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Names of the file entries written so far.
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Append a single file as `name`.
    pub fn append_file(&mut self, source: &Path, name: &str) -> Result<(), ArchiveError> {
        let file = File::open(source).map_err(io_err(source))?;
        let mut reader = BufReader::new(file);

        self.zip.start_file(name, self.options)?;
        io::copy(&mut reader, &mut self.zip).map_err(io_err(source))?;
        self.entries.push(name.to_string());
        Ok(())
    }

    /// Append an empty directory entry `name`.
    pub fn append_dir(&mut self, name: &str) -> Result<(), ArchiveError> {
        let options = FileOptions::default().compression_method(CompressionMethod::Stored);
        self.zip.add_directory(format!("{name}/"), options)?;
        Ok(())
    }

    /// Append the tree below `root` with entries prefixed by `prefix`.
    ///
    /// Directories for which `skip` returns true are left out entirely.
    /// Returns the number of files appended.
    pub fn append_tree(
        &mut self,
        root: &Path,
        prefix: &str,
        skip: impl Fn(&Path) -> bool,
    ) -> Result<usize, ArchiveError> {
        let mut appended = 0;
        self.append_dir(prefix)?;

        let walker = WalkDir::new(root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !(entry.file_type().is_dir() && skip(entry.path())));
        for entry in walker {
            let entry = entry.map_err(|e| ArchiveError::Io {
                path: root.to_path_buf(),
                source: e.into(),
            })?;
            let Ok(relative) = entry.path().strip_prefix(root) else {
                continue;
            };
            let name = entry_name(prefix, relative);

            if entry.file_type().is_dir() {
                self.append_dir(&name)?;
            } else if entry.file_type().is_file() {
                self.append_file(entry.path(), &name)?;
                appended += 1;
            } else {
                log::debug!(target: "archive", "Skipping special file {}", entry.path().display());
            }
        }

        Ok(appended)
    }

    pub fn finish(mut self) -> Result<PathBuf, ArchiveError> {
        let file = self.zip.finish()?;
        file.sync_all().map_err(io_err(&self.path))?;
        Ok(self.path)
    }
}

/// ZIP entry names always use `/` as separator.
fn entry_name(prefix: &str, relative: &Path) -> String {
    let mut name = prefix.to_string();
    for component in relative.components() {
        if let Component::Normal(part) = component {
            name.push('/');
            name.push_str(&part.to_string_lossy());
        }
    }
    name
}

/// Names of all entries of an archive.
pub fn list_entries(path: &Path) -> Result<Vec<String>, ArchiveError> {
    let file = File::open(path).map_err(io_err(path))?;
    let archive = ZipArchive::new(file)?;
    Ok(archive.file_names().map(str::to_string).collect())
}

/// Extract `archive` into `dest`, rejecting entries that would escape it.
///
/// Returns the number of extracted files.
pub fn extract(archive: &Path, dest: &Path) -> Result<usize, ArchiveError> {
    let file = File::open(archive).map_err(io_err(archive))?;
    let mut zip = ZipArchive::new(BufReader::new(file))?;
    fs::create_dir_all(dest).map_err(io_err(dest))?;

    let mut extracted = 0;
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let relative = entry
            .enclosed_name()
            .map(Path::to_path_buf)
            .ok_or_else(|| ArchiveError::UnsafeEntry(entry.name().to_string()))?;
        let target = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(io_err(&target))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let mut out = File::create(&target).map_err(io_err(&target))?;
        io::copy(&mut entry, &mut out).map_err(io_err(&target))?;
        extracted += 1;
    }

    Ok(extracted)
}
