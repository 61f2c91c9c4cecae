//! Input discovery by glob pattern.
//!
//! Snapshot directories are scanned with patterns relative to a root, e.g.
//! `**/*.gz` for raw dumps or `**/*.parquet` for transformed tables. Results are
//! sorted so batch numbering is stable across runs.

use anyhow::{Context, Result, bail};
use glob::glob;
use std::path::{Path, PathBuf};

/// Expand a glob pattern into a sorted list of matching files.
///
/// Directories are skipped. Zero matches is not an error.
///
/// ```no_run
/// use snapflow::io::glob::expand_glob;
///
/// let dumps = expand_glob("snapshot/**/*.gz")?;
/// # Ok::<(), anyhow::Error>(())
/// ```
///
/// # Errors
/// Fails on an invalid pattern or an unreadable directory entry.
pub fn expand_glob(pattern: &str) -> Result<Vec<PathBuf>> {
    let paths = glob(pattern).with_context(|| format!("invalid glob pattern: {pattern}"))?;

    let mut result = Vec::new();
    for entry in paths {
        let path = entry.with_context(|| format!("error reading glob entry for pattern: {pattern}"))?;
        if path.is_file() {
            result.push(path);
        }
    }
    result.sort();
    Ok(result)
}

/// Files under `root` matching `pattern`, which is relative to `root`.
///
/// # Errors
/// See [`expand_glob`].
pub fn discover_files(root: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let Some(root_str) = root.to_str() else {
        bail!("path is not valid UTF-8: {}", root.display());
    };
    // Metacharacters in the root are literal.
    let root_str = glob::Pattern::escape(root_str.trim_end_matches('/'));
    expand_glob(&format!("{root_str}/{}", pattern.trim_start_matches('/')))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn finds_nested_files_sorted() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::create_dir_all(dir.path().join("b"))?;
        fs::create_dir_all(dir.path().join("a/x.gz"))?;
        fs::write(dir.path().join("b/2.gz"), b"")?;
        fs::write(dir.path().join("b/1.gz"), b"")?;
        fs::write(dir.path().join("top.gz"), b"")?;
        fs::write(dir.path().join("skip.txt"), b"")?;

        let found = discover_files(dir.path(), "**/*.gz")?;
        let rel: Vec<_> = found.iter().map(|p| p.strip_prefix(dir.path()).map(Path::to_path_buf)).collect::<Result<_, _>>()?;
        assert_eq!(rel, vec![PathBuf::from("b/1.gz"), PathBuf::from("b/2.gz"), PathBuf::from("top.gz")]);
        Ok(())
    }
}
