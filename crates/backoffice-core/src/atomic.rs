//! Whole-file replacement for the config and session files.
//!
//! Contents go to a sibling `<name>.tmp` first and are renamed over the
//! target, so readers never see a half-written file and the target takes
//! the staging file's permissions.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Who may read the replaced file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    /// Process umask applies
    Default,
    /// 0600 on unix; holds credentials
    OwnerOnly,
}

pub(crate) fn replace_file(path: &Path, contents: &[u8], access: Access) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    let staging = staging_path(path);
    let mut file = open_staging(&staging, access)?;
    file.write_all(contents)
        .with_context(|| format!("Failed to write to {}", staging.display()))?;
    file.sync_all()
        .with_context(|| format!("Failed to flush {}", staging.display()))?;
    drop(file);

    fs::rename(&staging, path).with_context(|| {
        format!("Failed to move {} into {}", staging.display(), path.display())
    })
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map_or_else(OsString::new, OsString::from);
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(unix)]
fn open_staging(path: &Path, access: Access) -> Result<File> {
    use std::fs::OpenOptions;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    if access == Access::OwnerOnly {
        options.mode(0o600);
    }
    let file = options
        .open(path)
        .with_context(|| format!("Failed to open {} for writing", path.display()))?;

    // `mode` only applies on creation; a leftover staging file keeps its bits.
    if access == Access::OwnerOnly {
        file.set_permissions(fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to restrict {}", path.display()))?;
    }
    Ok(file)
}

#[cfg(not(unix))]
fn open_staging(path: &Path, _access: Access) -> Result<File> {
    File::create(path).with_context(|| format!("Failed to open {} for writing", path.display()))
}
