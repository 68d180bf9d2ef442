use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::archive::ArchiveSession;
use crate::domain::Scan;
use crate::error::XnatError;
use crate::fs_util::extract_zip_flat;

/// Downloads the files of `scan` and unpacks them flat into `path`.
///
/// The archive is stored next to the target as `<path>.zip` and removed
/// afterwards, also when extraction fails. Returns the extracted files.
pub fn download_scan<S: ArchiveSession + ?Sized>(
    session: &S,
    scan: &Scan,
    path: &Path,
) -> Result<Vec<PathBuf>, XnatError> {
    let zip_path = zip_path_for(path);
    fs::create_dir_all(path).map_err(XnatError::fs)?;

    info!(scan = %scan.label(), archive = %zip_path.display(), "downloading scan");
    let result = session
        .download_scan(scan, &zip_path)
        .and_then(|()| {
            info!(archive = %zip_path.display(), target = %path.display(), "extracting scan");
            extract_zip_flat(&zip_path, path)
        });

    if zip_path.exists() {
        if let Err(err) = fs::remove_file(&zip_path) {
            warn!(archive = %zip_path.display(), error = %err, "failed to remove scan archive");
        }
    }
    result
}

fn zip_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".zip");
    PathBuf::from(name)
}
