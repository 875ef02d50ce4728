//! Implements backup of the git working trees using [Sources].

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;

use super::{Backend, SnapshotContext, SnapshotError};
use crate::archive::{ArchiveWriter, REPOSITORIES_FILE, SOURCES_DIR};
use crate::repositories::{Git, RepositoryDescriptor};
use crate::util::fs::remove_file_if_exists;

/// The [Sources] backend archives the tree at `HEAD` of the main checkout
/// and of every configured auxiliary repository as `sources/<key>.tar.gz`,
/// and records their branch and commit in `repositories.json`.
pub struct Sources;

/// Compress `source` into `target`, removing `source` afterwards.
fn gzip(source: &Path, target: &Path) -> io::Result<()> {
    let mut reader = BufReader::new(File::open(source)?);
    let mut encoder = GzEncoder::new(File::create_new(target)?, Compression::default());
    io::copy(&mut reader, &mut encoder)?;
    encoder.finish()?.sync_all()?;
    remove_file_if_exists(source)
}

impl Backend for Sources {
    fn name(&self) -> &'static str {
        "sources"
    }

    fn snapshot(&self, ctx: &SnapshotContext<'_>, archive: &mut ArchiveWriter) -> Result<(), SnapshotError> {
        let git = Git::new(ctx.runner);
        let mut descriptor = RepositoryDescriptor::default();

        for (key, worktree) in ctx.settings.repository_paths() {
            log::info!(target: "backend::sources", "Archive repository {key}: {}", worktree.display());
            let checkout = git.current(&worktree)?;
            log::debug!(target: "backend::sources", "{key} is at {} ({})", checkout.commit, checkout.branch);

            let tar = ctx.staging.join(format!("{key}.tar"));
            let tarball = ctx.staging.join(format!("{key}.tar.gz"));
            git.archive_head(&worktree, &tar)?;
            gzip(&tar, &tarball).map_err(SnapshotError::io(format!("compressing sources of {key}")))?;

            archive.append_file(&tarball, &format!("{SOURCES_DIR}/{key}.tar.gz"))?;
            remove_file_if_exists(&tarball).map_err(SnapshotError::io("removing source archive"))?;
            descriptor.insert(key, checkout);
        }

        let descriptor_path = ctx.staging.join(REPOSITORIES_FILE);
        descriptor.write(&descriptor_path)?;
        archive.append_file(&descriptor_path, REPOSITORIES_FILE)?;
        remove_file_if_exists(&descriptor_path).map_err(SnapshotError::io("removing repository descriptor"))?;
        Ok(())
    }
}
