//! Capability-scoped file helpers built on `cap-std`.

use std::io;

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

/// File access failure annotated with the path involved.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum FileError {
    /// Filesystem operation failed.
    #[error("{path}: {message}")]
    Io {
        /// Path involved.
        path: String,
        /// Underlying error message.
        message: String,
    },
    /// Path has no file name component.
    #[error("{path}: path is missing a filename")]
    MissingFileName {
        /// Path involved.
        path: String,
    },
}

fn split(path: &Utf8Path) -> Result<(&Utf8Path, &str), FileError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().ok_or_else(|| FileError::MissingFileName {
        path: path.to_string(),
    })?;
    Ok((parent, file_name))
}

fn io_error(path: &Utf8Path, err: &io::Error) -> FileError {
    FileError::Io {
        path: path.to_string(),
        message: err.to_string(),
    }
}

/// Reads `path`, returning `None` when it (or its directory) does not exist.
///
/// # Errors
///
/// Returns [`FileError`] for any failure other than absence.
pub fn read_optional(path: &Utf8Path) -> Result<Option<String>, FileError> {
    let (parent, file_name) = split(path)?;
    let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_error(parent, &err)),
    };
    match dir.read_to_string(file_name) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_error(path, &err)),
    }
}

/// Writes `contents` to `path`, creating parent directories. The file is
/// written to a sibling temporary name and renamed into place.
///
/// # Errors
///
/// Returns [`FileError`] when any filesystem step fails.
pub fn write_replace(path: &Utf8Path, contents: &str) -> Result<(), FileError> {
    let (parent, file_name) = split(path)?;
    Dir::create_ambient_dir_all(parent, ambient_authority())
        .map_err(|err| io_error(parent, &err))?;
    let dir =
        Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| io_error(parent, &err))?;

    let staging = format!(".{file_name}.tmp");
    dir.write(&staging, contents)
        .map_err(|err| io_error(path, &err))?;
    dir.rename(&staging, &dir, file_name)
        .map_err(|err| io_error(path, &err))
}
