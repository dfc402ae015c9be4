//! Startup script template resolution.
//!
//! A template may be configured inline or as a path to a file. The two
//! sources are mutually exclusive; file paths may start with `~/`.

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

/// Errors raised while resolving a startup script template.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum TemplateError {
    /// Raised when both inline and file sources are provided.
    #[error("{name} startup script cannot be provided both inline and via file")]
    BothProvided {
        /// Template being resolved (for example `linux`).
        name: String,
    },
    /// Raised when the file path is blank.
    #[error("{name} startup script file path must not be empty")]
    FilePathEmpty {
        /// Template being resolved.
        name: String,
    },
    /// Raised when reading the template file fails.
    #[error("failed to read {name} startup script `{path}`: {message}")]
    FileRead {
        /// Template being resolved.
        name: String,
        /// Expanded path that failed to read.
        path: String,
        /// Underlying error message.
        message: String,
    },
}

/// Resolves a template from either an inline value or a file.
///
/// Returns `None` when neither source is set. Blank inline values count as
/// unset; the caller decides whether a template is required.
///
/// # Errors
///
/// Returns [`TemplateError`] when both sources are set or the file cannot be
/// read.
pub fn resolve_template(
    name: &str,
    inline: Option<&str>,
    file: Option<&str>,
) -> Result<Option<String>, TemplateError> {
    let inline_value = inline.filter(|value| !value.trim().is_empty());
    if inline_value.is_some() && file.is_some() {
        return Err(TemplateError::BothProvided {
            name: name.to_owned(),
        });
    }
    if let Some(payload) = inline_value {
        return Ok(Some(payload.to_owned()));
    }

    let Some(path) = file else {
        return Ok(None);
    };
    if path.trim().is_empty() {
        return Err(TemplateError::FilePathEmpty {
            name: name.to_owned(),
        });
    }

    let expanded = expand_tilde(path.trim());
    let content = read_to_string_ambient(&expanded).map_err(|message| TemplateError::FileRead {
        name: name.to_owned(),
        path: expanded.clone(),
        message,
    })?;
    Ok(Some(content).filter(|value| !value.trim().is_empty()))
}

fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

fn read_to_string_ambient(path: &str) -> Result<String, String> {
    let path_buf = Utf8Path::new(path);

    let (dir_path, file_path) = if path_buf.is_absolute() {
        let parent = path_buf
            .parent()
            .ok_or_else(|| format!("path has no parent directory: {path_buf}"))?;
        let file_name = path_buf
            .file_name()
            .ok_or_else(|| format!("path has no file name: {path_buf}"))?;
        (parent, Utf8Path::new(file_name))
    } else {
        (Utf8Path::new("."), path_buf)
    };

    let dir =
        Dir::open_ambient_dir(dir_path, ambient_authority()).map_err(|err| err.to_string())?;
    dir.read_to_string(file_path).map_err(|err| err.to_string())
}
