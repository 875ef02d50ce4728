//! Locating, sanitizing and loading the SQL dump of a snapshot.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use derive_more::{Display, Error, From};
use regex::Regex;
use walkdir::WalkDir;

use crate::backends::postgres::connect;
use crate::config::DbEnv;
use crate::process::{CommandError, CommandRunner, CommandSpec};

/// Ownership statements of a `pg_dump`. The restored objects belong to the
/// user creating them instead.
static OWNER_STATEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^[ \t]*ALTER[ \t]+[^;]*?[ \t]OWNER[ \t]+TO[ \t]+[^;]*;[ \t]*(?:\r?\n)?")
        .expect("regex should compile")
});

#[derive(Debug, Display, Error, From)]
pub enum DumpError {
    #[display("the snapshot contains no SQL dump")]
    NoDump,
    #[from(ignore)]
    #[display("the snapshot contains more than one SQL dump: {}", fmt_paths(_0))]
    MultipleDumps(#[error(ignore)] Vec<PathBuf>),
    #[from(ignore)]
    #[display("reading dump {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[display("loading the dump failed: {_0}")]
    Command(CommandError),
    #[from(ignore)]
    #[display("loading the dump reported errors: {_0}")]
    Load(#[error(ignore)] String),
}

fn fmt_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// The single `*.sql` file at the top level of `dir`.
///
/// Files in subdirectories, such as uploaded media, are never dumps.
pub fn find_dump(dir: &Path) -> Result<PathBuf, DumpError> {
    let mut dumps: Vec<PathBuf> = WalkDir::new(dir)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("sql")))
        .collect();

    match dumps.len() {
        0 => Err(DumpError::NoDump),
        1 => Ok(dumps.remove(0)),
        _ => Err(DumpError::MultipleDumps(dumps)),
    }
}

/// Remove all ownership statements from `sql`.
pub fn strip_ownership(sql: &str) -> String {
    OWNER_STATEMENT.replace_all(sql, "").into_owned()
}

/// Rewrite the dump at `path` without ownership statements.
///
/// Returns the number of removed statements.
pub fn sanitize(path: &Path) -> Result<usize, DumpError> {
    let io_err = |source| DumpError::Io {
        path: path.to_path_buf(),
        source,
    };
    let sql = fs::read_to_string(path).map_err(io_err)?;
    let removed = OWNER_STATEMENT.find_iter(&sql).count();
    if removed > 0 {
        fs::write(path, strip_ownership(&sql)).map_err(io_err)?;
    }
    log::debug!(target: "restore::dump", "Removed {removed} ownership statements from {}", path.display());
    Ok(removed)
}

/// Load the dump at `path` into the target database with `psql`.
///
/// Fails on a non-zero exit code and on errors reported on stderr.
pub fn load(runner: &dyn CommandRunner, db: &DbEnv, path: &Path) -> Result<(), DumpError> {
    let spec = connect(CommandSpec::new("psql"), &db.host, db.port, &db.user, &db.password)
        .arg(format!("--dbname={}", db.name))
        .args(["-v", "ON_ERROR_STOP=1", "--quiet", "-f"])
        .arg(path.to_string_lossy());
    log::info!(target: "restore::dump", "Loading dump into {}", db.name);

    let output = runner.run(&spec)?;
    if output.stderr.contains("ERROR") {
        return Err(DumpError::Load(output.stderr.trim().to_string()));
    }
    Ok(())
}
