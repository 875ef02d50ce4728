//! Implements backup of the installed dependency set using [Dependencies].

use super::{Backend, SnapshotContext, SnapshotError};
use crate::archive::{ArchiveWriter, MANIFEST_FILE};
use crate::process::CommandSpec;
use crate::util::fs::remove_file_if_exists;

/// The [Dependencies] backend stores the output of the configured freeze
/// command (one package spec per line) as `requirements.txt`.
pub struct Dependencies;

impl Backend for Dependencies {
    fn name(&self) -> &'static str {
        "dependencies"
    }

    fn snapshot(&self, ctx: &SnapshotContext<'_>, archive: &mut ArchiveWriter) -> Result<(), SnapshotError> {
        let Some(freeze) = CommandSpec::from_argv(&ctx.settings.dependencies.freeze) else {
            log::warn!(target: "backend::dependencies", "No freeze command configured, skipping manifest");
            return Ok(());
        };

        let manifest = ctx.staging.join(MANIFEST_FILE);
        log::info!(target: "backend::dependencies", "Create dependency manifest: {freeze}");
        ctx.runner.run(
            &freeze
                .current_dir(&ctx.settings.repository_root)
                .stdout_to(&manifest),
        )?;

        archive.append_file(&manifest, MANIFEST_FILE)?;
        remove_file_if_exists(&manifest).map_err(SnapshotError::io("removing dependency manifest"))?;
        Ok(())
    }
}
