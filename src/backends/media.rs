//! Implements backup of the uploaded media using [Media].

use std::fs;
use std::path::{Path, PathBuf};

use super::{Backend, SnapshotContext, SnapshotError};
use crate::archive::{ArchiveWriter, MEDIA_DIR};

/// The [Media] backend archives the media root below `media/`.
///
/// If the backup directory lives inside the media root it is skipped, so
/// earlier archives are never included in new ones.
pub struct Media;

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

impl Backend for Media {
    fn name(&self) -> &'static str {
        "media"
    }

    fn snapshot(&self, ctx: &SnapshotContext<'_>, archive: &mut ArchiveWriter) -> Result<(), SnapshotError> {
        let media_root = &ctx.settings.media_root;
        if !media_root.is_dir() {
            log::warn!(target: "backend::media", "Media root {} doesn't exist, archiving nothing", media_root.display());
            archive.append_dir(MEDIA_DIR)?;
            return Ok(());
        }
        log::info!(target: "backend::media", "Archive media root: {}", media_root.display());

        let backup_dir = canonical(&ctx.settings.backup_dir);
        let skip = |dir: &Path| {
            let skipped = canonical(dir) == backup_dir;
            if skipped {
                log::debug!(target: "backend::media", "Skipping backup directory {}", dir.display());
            }
            skipped
        };

        let files = archive.append_tree(media_root, MEDIA_DIR, skip)?;
        log::info!(target: "backend::media", "Finished media archive: {files} files");
        Ok(())
    }
}
