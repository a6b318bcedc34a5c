//! Small filesystem helpers shared by the parent and the worker processes.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::Path;

use anyhow::{bail, format_err, Error};
use nix::unistd;

/// Write a file atomically: the content lands in a temporary sibling first,
/// then gets renamed over the destination.
///
/// Note: we use mkstemp here because this works with different processes
/// writing into the same directory.
pub fn file_set_contents<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<(), Error> {
    let path = path.as_ref();

    let mut template = path.to_owned();
    template.set_extension("tmp_XXXXXX");

    let (fd, tmp_path) = match unistd::mkstemp(&template) {
        Ok((fd, path)) => (fd, path),
        Err(err) => bail!("mkstemp {:?} failed - {}", template, err),
    };

    use std::os::unix::io::FromRawFd;
    let mut file = unsafe { File::from_raw_fd(fd) };

    if let Err(err) = file.write_all(data) {
        let _ = unistd::unlink(&tmp_path);
        bail!("write {:?} failed - {}", tmp_path, err);
    }

    if let Err(err) = std::fs::rename(&tmp_path, path) {
        let _ = unistd::unlink(&tmp_path);
        bail!("atomic rename to {:?} failed - {}", path, err);
    }

    Ok(())
}

/// Read a whole file into a string.
pub fn file_get_contents<P: AsRef<Path>>(path: P) -> Result<String, Error> {
    let path = path.as_ref();

    let mut contents = String::new();
    File::open(path)
        .and_then(|mut f| f.read_to_string(&mut contents))
        .map_err(|err| format_err!("unable to read {:?} - {}", path, err))?;

    Ok(contents)
}

/// Create an empty file, or update its mtime when it already exists.
pub fn touch<P: AsRef<Path>>(path: P) -> Result<(), Error> {
    let path = path.as_ref();

    OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .map_err(|err| format_err!("unable to touch {:?} - {}", path, err))?;

    Ok(())
}

/// Create a file exclusively. Returns `None` when the file already exists,
/// which is how work-item claims are lost to another process.
pub fn create_exclusive<P: AsRef<Path>>(path: P) -> Result<Option<File>, Error> {
    let path = path.as_ref();

    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => Ok(Some(file)),
        Err(ref err) if err.kind() == ErrorKind::AlreadyExists => Ok(None),
        Err(err) => bail!("unable to create {:?} - {}", path, err),
    }
}

pub fn file_exists<P: AsRef<Path>>(path: P) -> bool {
    path.as_ref().is_file()
}

pub fn directory_exists<P: AsRef<Path>>(path: P) -> bool {
    path.as_ref().is_dir()
}

/// Make sure the given directory exists and is empty.
pub fn ensure_empty_dir<P: AsRef<Path>>(path: P) -> Result<(), Error> {
    let path = path.as_ref();

    if path.exists() {
        std::fs::remove_dir_all(path)
            .map_err(|err| format_err!("unable to remove {:?} - {}", path, err))?;
    }

    std::fs::create_dir_all(path)
        .map_err(|err| format_err!("unable to create {:?} - {}", path, err))
}

/// mkdir -p, leaving existing content alone.
pub fn ensure_dir<P: AsRef<Path>>(path: P) -> Result<(), Error> {
    let path = path.as_ref();

    std::fs::create_dir_all(path)
        .map_err(|err| format_err!("unable to create {:?} - {}", path, err))
}

/// Parse a human readable byte size such as "16MB", "1 GB" or "512".
pub fn parse_pretty_size(input: &str) -> Result<u64, Error> {
    let input = input.trim();

    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or_else(|| input.len());

    let (digits, unit) = input.split_at(split);

    let number: u64 = digits
        .parse()
        .map_err(|_| format_err!("invalid size {:?}", input))?;

    let factor = match unit.trim() {
        "" | "B" => 1,
        "kB" | "KB" => 1024,
        "MB" => 1024 * 1024,
        "GB" => 1024 * 1024 * 1024,
        "TB" => 1024u64.pow(4),
        other => bail!("unknown size unit {:?} in {:?}", other, input),
    };

    number
        .checked_mul(factor)
        .ok_or_else(|| format_err!("size {:?} overflows", input))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get_contents_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot");

        file_set_contents(&path, b"00000003-0000001B-1").unwrap();
        assert_eq!(file_get_contents(&path).unwrap(), "00000003-0000001B-1");

        // overwrite is atomic, not append
        file_set_contents(&path, b"other").unwrap();
        assert_eq!(file_get_contents(&path).unwrap(), "other");
    }

    #[test]
    fn create_exclusive_claims_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("16384");

        assert!(create_exclusive(&path).unwrap().is_some());
        assert!(create_exclusive(&path).unwrap().is_none());
    }

    #[test]
    fn pretty_sizes() {
        assert_eq!(parse_pretty_size("16MB").unwrap(), 16 * 1024 * 1024);
        assert_eq!(parse_pretty_size("1 GB").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_pretty_size("512").unwrap(), 512);
        assert_eq!(parse_pretty_size("8kB").unwrap(), 8192);
        assert!(parse_pretty_size("eleven").is_err());
    }
}
