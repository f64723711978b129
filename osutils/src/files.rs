use std::{
    fs,
    io::Write,
    os::unix::fs::PermissionsExt,
    path::Path,
};

use anyhow::{bail, Context, Error};
use tempfile::NamedTempFile;

/// Creates all directories in a path if they don't exist
pub fn create_dirs<S>(path: S) -> Result<(), Error>
where
    S: AsRef<Path>,
{
    fs::create_dir_all(path.as_ref()).context(format!(
        "Could not create path: {}",
        path.as_ref().display()
    ))
}

/// Atomically writes `data` to `path` with the given file mode. The data is
/// staged in a temporary file in the target directory and renamed into
/// place, so readers never observe a partial file. The mode is applied
/// before the rename.
pub fn atomic_write_mode(path: impl AsRef<Path>, mode: u32, data: &[u8]) -> Result<(), Error> {
    let path = path.as_ref();
    let dir = path
        .parent()
        .with_context(|| format!("Path '{}' has no parent directory", path.display()))?;

    let mut staged = NamedTempFile::new_in(dir).context(format!(
        "Failed to create temporary file in '{}'",
        dir.display()
    ))?;
    staged
        .write_all(data)
        .context(format!("Failed to stage contents of '{}'", path.display()))?;
    staged
        .as_file()
        .set_permissions(fs::Permissions::from_mode(mode))
        .context(format!("Failed to set mode on '{}'", path.display()))?;
    staged
        .persist(path)
        .context(format!("Failed to persist '{}'", path.display()))?;
    Ok(())
}

/// Reads a file that must be exactly `expected_len` bytes long. Any other
/// size is reported as a distinct error naming both lengths.
pub fn read_exact_file(path: impl AsRef<Path>, expected_len: usize) -> Result<Vec<u8>, Error> {
    let path = path.as_ref();
    let data =
        fs::read(path).context(format!("Could not read file: {}", path.display()))?;
    if data.len() != expected_len {
        bail!(
            "File '{}' is {} bytes, expected exactly {}",
            path.display(),
            data.len(),
            expected_len
        );
    }
    Ok(data)
}

/// Reads the content of a file and trims it
pub fn read_file_trim(file_path: &Path) -> Result<String, Error> {
    let content = fs::read_to_string(file_path)
        .context(format!("Could not read file contents: {:?}", file_path))?;
    Ok(content.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_write_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth");

        atomic_write_mode(&path, 0o600, b"sixteen byte bin").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"sixteen byte bin");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_atomic_write_mode_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth");
        fs::write(&path, b"old").unwrap();

        atomic_write_mode(&path, 0o600, b"new").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn test_read_exact_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recovery");
        fs::write(&path, [7u8; 16]).unwrap();

        assert_eq!(read_exact_file(&path, 16).unwrap(), vec![7u8; 16]);

        fs::write(&path, [7u8; 15]).unwrap();
        let err = read_exact_file(&path, 16).unwrap_err();
        assert!(err.to_string().contains("15 bytes, expected exactly 16"));
    }

    #[test]
    fn test_read_file_trim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mode");
        fs::write(&path, "run\n").unwrap();
        assert_eq!(read_file_trim(&path).unwrap(), "run");
    }
}
