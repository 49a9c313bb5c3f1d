//! Path Utilities
//!
//! Small filesystem helpers used for protocol working directories and
//! step postconditions.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;

/// Creates every directory in `paths`, parents included.
pub fn make_path<P: AsRef<Path>>(paths: &[P]) -> io::Result<()> {
    for path in paths {
        let path = path.as_ref();
        if !path.exists() {
            fs::create_dir_all(path)?;
            debug!("Created directory: {}", path.display());
        }
    }
    Ok(())
}

/// Removes files or whole directory trees. Missing paths are ignored.
pub fn clean_path<P: AsRef<Path>>(paths: &[P]) -> io::Result<()> {
    for path in paths {
        let path = path.as_ref();
        if path.is_dir() {
            fs::remove_dir_all(path)?;
            debug!("Removed directory: {}", path.display());
        } else if path.exists() {
            fs::remove_file(path)?;
            debug!("Removed file: {}", path.display());
        }
    }
    Ok(())
}

/// Returns the entries of `paths` that do not exist.
pub fn missing_paths<S: AsRef<str>>(paths: &[S]) -> Vec<String> {
    paths
        .iter()
        .map(|p| p.as_ref())
        .filter(|p| !Path::new(p).exists())
        .map(str::to_string)
        .collect()
}

/// Joins relative paths onto `base`; absolute paths are kept as they are.
pub fn resolve(base: &Path, path: &str) -> PathBuf {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base.join(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_make_and_clean_path() {
        let temp_dir = tempdir().unwrap();
        let nested = temp_dir.path().join("Runs/Prot1/extra");

        make_path(&[&nested]).unwrap();
        assert!(nested.is_dir());

        fs::write(nested.join("out.txt"), "x").unwrap();
        clean_path(&[temp_dir.path().join("Runs")]).unwrap();
        assert!(!temp_dir.path().join("Runs").exists());
    }

    #[test]
    fn test_clean_missing_path_is_ok() {
        let temp_dir = tempdir().unwrap();
        assert!(clean_path(&[temp_dir.path().join("nothing")]).is_ok());
    }

    #[test]
    fn test_missing_paths() {
        let temp_dir = tempdir().unwrap();
        let present = temp_dir.path().join("present.txt");
        fs::write(&present, "x").unwrap();
        let absent = temp_dir.path().join("absent.txt");

        let missing = missing_paths(&[
            present.display().to_string(),
            absent.display().to_string(),
        ]);
        assert_eq!(missing, vec![absent.display().to_string()]);
    }

    #[test]
    fn test_resolve() {
        let base = Path::new("/data/Runs/Prot1");
        assert_eq!(resolve(base, "out.txt"), PathBuf::from("/data/Runs/Prot1/out.txt"));
        assert_eq!(resolve(base, "/tmp/out.txt"), PathBuf::from("/tmp/out.txt"));
    }
}
