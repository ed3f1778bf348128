use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::unistd::{chown, Gid, Group};

/// Sibling temp file for `path`, unique per call
pub fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = format!(".{}.tmp.{}", name, uuid::Uuid::new_v4().simple());
    match path.parent() {
        Some(dir) => dir.join(tmp),
        None => PathBuf::from(tmp),
    }
}

/// Resolve a group given by name or numeric id
pub fn resolve_group(group: &str) -> io::Result<Gid> {
    if let Ok(id) = group.parse::<u32>() {
        return Ok(Gid::from_raw(id));
    }
    match Group::from_name(group) {
        Ok(Some(g)) => Ok(g.gid),
        Ok(None) => Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("group '{}' not found", group),
        )),
        Err(e) => Err(io::Error::from(e)),
    }
}

/// Write `contents` to `path` so readers only ever see the old or the new
/// bytes: write a sibling temp file, then rename it over the target.
pub fn atomic_write(path: &Path, contents: &[u8], mode: u32, group: Option<Gid>) -> io::Result<()> {
    let tmp = temp_path(path);
    let result = write_then_rename(&tmp, path, contents, mode, group);
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn write_then_rename(
    tmp: &Path,
    path: &Path,
    contents: &[u8],
    mode: u32,
    group: Option<Gid>,
) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    // the umask may have narrowed the requested mode
    fs::set_permissions(tmp, fs::Permissions::from_mode(mode))?;
    if let Some(gid) = group {
        chown(tmp, None, Some(gid)).map_err(io::Error::from)?;
    }
    fs::rename(tmp, path)
}

/// Check that a file can be created next to `path` with the given owner and
/// mode, without touching `path` itself.
pub fn check_writable(path: &Path, mode: u32, group: Option<Gid>) -> io::Result<()> {
    let tmp = temp_path(path);
    let result = (|| {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(&tmp)?;
        drop(file);
        if let Some(gid) = group {
            chown(tmp.as_path(), None, Some(gid)).map_err(io::Error::from)?;
        }
        Ok(())
    })();
    let _ = fs::remove_file(&tmp);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_write_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");

        atomic_write(&path, b"first", 0o640, None).unwrap();
        atomic_write(&path, b"second", 0o640, None).unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);
        // no temp files left behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_writable_check_does_not_create_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");

        check_writable(&path, 0o640, None).unwrap();
        assert!(!path.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_writable_check_fails_for_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("token");
        assert!(check_writable(&path, 0o640, None).is_err());
    }

    #[test]
    fn test_temp_path_is_sibling() {
        let tmp = temp_path(Path::new("/var/run/agent/token"));
        assert_eq!(tmp.parent(), Some(Path::new("/var/run/agent")));
        assert!(tmp
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(".token.tmp."));
    }

    #[test]
    fn test_resolve_numeric_group() {
        assert_eq!(resolve_group("0").unwrap(), Gid::from_raw(0));
        assert!(resolve_group("no-such-group-here").is_err());
    }
}
