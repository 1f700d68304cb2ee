//! File access for the artifact and kubeconfig through ambient `cap-std`
//! directories.

use std::io::{self, BufReader, BufWriter};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir, fs_utf8::File};
use thiserror::Error;

/// Errors raised while opening or reading local files.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FileError {
    /// Raised when the file system rejects an operation.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when a path does not name a file.
    #[error("{path} does not name a file")]
    NotAFile {
        /// Offending path.
        path: Utf8PathBuf,
    },
}

fn split(path: &Utf8Path) -> Result<(&Utf8Path, &str), FileError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().ok_or_else(|| FileError::NotAFile {
        path: path.to_path_buf(),
    })?;
    Ok((parent, file_name))
}

fn io_error(path: &Utf8Path, err: &io::Error) -> FileError {
    FileError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

/// Creates or truncates `path` for writing, creating parent directories as
/// needed.
///
/// # Errors
///
/// Returns [`FileError`] when the directory or file cannot be created.
pub fn create_truncated(path: &Utf8Path) -> Result<BufWriter<File>, FileError> {
    let (parent, file_name) = split(path)?;
    Dir::create_ambient_dir_all(parent, ambient_authority())
        .map_err(|err| io_error(parent, &err))?;
    let dir =
        Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| io_error(parent, &err))?;
    let file = dir.create(file_name).map_err(|err| io_error(path, &err))?;
    Ok(BufWriter::new(file))
}

/// Opens `path` for buffered reading.
///
/// # Errors
///
/// Returns [`FileError`] when the file cannot be opened.
pub fn open_buffered(path: &Utf8Path) -> Result<BufReader<File>, FileError> {
    let (parent, file_name) = split(path)?;
    let dir =
        Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| io_error(parent, &err))?;
    let file = dir.open(file_name).map_err(|err| io_error(path, &err))?;
    Ok(BufReader::new(file))
}

/// Reads `path` into a string.
///
/// # Errors
///
/// Returns [`FileError`] when the file cannot be read.
pub fn read_to_string(path: &Utf8Path) -> Result<String, FileError> {
    let (parent, file_name) = split(path)?;
    let dir =
        Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| io_error(parent, &err))?;
    dir.read_to_string(file_name)
        .map_err(|err| io_error(path, &err))
}

/// Reads `path` into bytes.
///
/// # Errors
///
/// Returns [`FileError`] when the file cannot be read.
pub fn read(path: &Utf8Path) -> Result<Vec<u8>, FileError> {
    let (parent, file_name) = split(path)?;
    let dir =
        Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| io_error(parent, &err))?;
    dir.read(file_name).map_err(|err| io_error(path, &err))
}
