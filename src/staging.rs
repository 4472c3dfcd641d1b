//! Copies the bundled server sources into the writable server directory.

use std::fs;
use std::io;
use std::path::Path;

use log::{debug, info};

pub const STAMP_FILE: &str = ".ddt-stage";

const SKIP_DIRS: &[&str] = &["venv", ".venv", "__pycache__", ".git", "node_modules"];

fn read_stamp(target: &Path) -> Option<String> {
    fs::read_to_string(target.join(STAMP_FILE))
        .ok()
        .map(|raw| raw.trim().to_string())
}

/// Copies `source` into `target` unless `target` already carries `stamp`.
///
/// Top-level entries named in `preserve` are left alone when they already
/// exist in `target`. Returns whether anything was copied.
pub fn stage_server_tree(
    source: &Path,
    target: &Path,
    stamp: &str,
    preserve: &[String],
) -> io::Result<bool> {
    if read_stamp(target).as_deref() == Some(stamp) {
        debug!("server tree at {} is current ({stamp})", target.display());
        return Ok(false);
    }
    if !source.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("server sources not found at {}", source.display()),
        ));
    }

    info!(
        "staging server tree {} -> {} ({stamp})",
        source.display(),
        target.display()
    );
    fs::create_dir_all(target)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let name = entry.file_name();
        let name_text = name.to_string_lossy();
        let dest = target.join(&name);
        if preserve.iter().any(|keep| keep.as_str() == name_text) && dest.exists() {
            debug!("preserving {}", dest.display());
            continue;
        }
        copy_entry(&entry.path(), &dest)?;
    }
    fs::write(target.join(STAMP_FILE), stamp)?;
    Ok(true)
}

fn copy_entry(from: &Path, to: &Path) -> io::Result<()> {
    let file_type = fs::symlink_metadata(from)?.file_type();
    if file_type.is_dir() {
        let skip = from
            .file_name()
            .map(|name| SKIP_DIRS.iter().any(|dir| name == *dir))
            .unwrap_or(false);
        if skip {
            return Ok(());
        }
        fs::create_dir_all(to)?;
        for entry in fs::read_dir(from)? {
            let entry = entry?;
            copy_entry(&entry.path(), &to.join(entry.file_name()))?;
        }
    } else if file_type.is_file() {
        fs::copy(from, to)?;
    }
    Ok(())
}
