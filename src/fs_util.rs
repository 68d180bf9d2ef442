use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use zip::ZipArchive;

use crate::error::XnatError;

/// Extracts every file of the archive directly into `target_dir`, keeping
/// only its base name. Directory entries are skipped. Returns the written
/// paths in archive order.
pub fn extract_zip_flat(zip_path: &Path, target_dir: &Path) -> Result<Vec<PathBuf>, XnatError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| XnatError::Filesystem(format!("open zip {}: {err}", zip_path.display())))?;
    let mut archive = ZipArchive::new(file).map_err(XnatError::fs)?;

    let mut written = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(XnatError::fs)?;
        if entry.is_dir() {
            continue;
        }
        let Some(file_name) = entry
            .enclosed_name()
            .and_then(|path| path.file_name().map(|name| name.to_os_string()))
        else {
            return Err(XnatError::Filesystem(format!(
                "unsafe zip entry name: {}",
                entry.name()
            )));
        };

        let target = target_dir.join(file_name);
        let mut outfile = fs::File::create(&target).map_err(XnatError::fs)?;
        io::copy(&mut entry, &mut outfile).map_err(XnatError::fs)?;
        written.push(target);
    }
    Ok(written)
}

/// Lists the regular files directly inside `dir`, sorted by name.
pub fn list_files(dir: &Path) -> Result<Vec<PathBuf>, XnatError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(XnatError::fs)? {
        let path = entry.map_err(XnatError::fs)?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Writes `content` to `path` unless it is empty. Returns whether a file was written.
pub fn write_if_not_empty(path: &Path, content: &[u8]) -> Result<bool, XnatError> {
    if content.is_empty() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(XnatError::fs)?;
    }
    fs::write(path, content).map_err(XnatError::fs)?;
    Ok(true)
}
