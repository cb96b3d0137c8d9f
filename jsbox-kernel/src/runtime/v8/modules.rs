//! Module source lookup backing the sandbox's `require`

use serde::Serialize;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("Module loading is disabled")]
    Disabled,

    #[error("Invalid module specifier '{0}'")]
    InvalidSpecifier(String),

    #[error("Cannot find module '{0}'")]
    NotFound(String),

    #[error("Failed to read module '{specifier}': {source}")]
    Io {
        specifier: String,
        source: std::io::Error,
    },
}

/// Module source handed to the sandbox
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadedModule {
    pub filename: String,
    pub source: String,
}

/// Directory that `require` specifiers resolve against.
///
/// Specifiers are plain relative paths: absolute paths and `..` components
/// are rejected, and `.js` is appended when no extension is given.
#[derive(Debug, Clone, Default)]
pub struct ModuleRoot {
    root: Option<PathBuf>,
}

impl ModuleRoot {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    pub fn disabled() -> Self {
        Self { root: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.root.is_some()
    }

    pub fn resolve(&self, specifier: &str) -> Result<PathBuf, ModuleError> {
        let root = self.root.as_ref().ok_or(ModuleError::Disabled)?;
        let invalid = || ModuleError::InvalidSpecifier(specifier.to_string());

        let relative = Path::new(specifier);
        if specifier.is_empty() {
            return Err(invalid());
        }
        let mut normalized = PathBuf::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                _ => return Err(invalid()),
            }
        }
        if normalized.as_os_str().is_empty() {
            return Err(invalid());
        }
        if normalized.extension().is_none() {
            normalized.set_extension("js");
        }

        let candidate = root.join(&normalized);
        if !candidate.is_file() {
            return Err(ModuleError::NotFound(specifier.to_string()));
        }

        // Symlinks must not lead outside the root.
        let io_err = |source| ModuleError::Io {
            specifier: specifier.to_string(),
            source,
        };
        let canonical_root = root.canonicalize().map_err(io_err)?;
        let canonical = candidate.canonicalize().map_err(io_err)?;
        if !canonical.starts_with(&canonical_root) {
            return Err(invalid());
        }
        Ok(canonical)
    }

    pub fn load(&self, specifier: &str) -> Result<LoadedModule, ModuleError> {
        let path = self.resolve(specifier)?;
        let source = std::fs::read_to_string(&path).map_err(|source| ModuleError::Io {
            specifier: specifier.to_string(),
            source,
        })?;
        tracing::debug!(specifier, path = %path.display(), "Loaded sandbox module");
        Ok(LoadedModule {
            filename: path.display().to_string(),
            source,
        })
    }
}
