//! Artifact Store (C8): content-addressed, hash-verified persistence for
//! correction artifacts, apply metadata, and session records.
//!
//! Writes are atomic (write to a temp file, then rename into place), and
//! serialization favors canonical, reproducible byte output over anything
//! insertion-order-dependent. `serde_json::Value` built without the
//! `preserve_order` feature serializes object keys from a `BTreeMap`, so
//! plain `serde_json::to_vec` already yields the lexicographically sorted,
//! canonical byte form required for hashing — no bespoke canonicalizer is
//! needed.

use crate::error::{Error, Result, SafetyViolation};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

/// Serialize `value` to its canonical (sorted-key) JSON byte form.
///
/// # Errors
///
/// Returns [`Error::InvariantViolation`] if `value` cannot be serialized;
/// this only happens for non-finite floats, which every public type in
/// this crate already rejects at construction.
pub fn canonical_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|e| Error::InvariantViolation(format!("failed to serialize artifact: {e}")))
}

/// Lowercase hex SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Characters that, if leading a CSV cell, would be interpreted as a
/// formula by a spreadsheet application (CSV formula injection).
const CSV_FORMULA_LEADERS: &[char] = &['=', '+', '-', '@', '\t', '\r'];

/// Prefix a CSV cell with `'` if it begins with a character a spreadsheet
/// would interpret as a formula trigger.
#[must_use]
pub fn sanitize_csv_cell(cell: &str) -> String {
    if cell.starts_with(CSV_FORMULA_LEADERS) {
        format!("'{cell}")
    } else {
        cell.to_owned()
    }
}

/// A content-addressed, hash-verified file store rooted at a fixed
/// directory. Every write is atomic (temp file + rename) and is
/// accompanied by a `.sha256` side-file recording the content's digest.
#[derive(Clone, Debug)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open a store rooted at `root`, creating the directory if absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if `root` cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| Error::io(root.display().to_string(), e))?;
        Ok(Self { root })
    }

    /// Resolve `name` to a path inside the store, rejecting any attempt to
    /// escape the root via `..` components or an absolute path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SafetyViolation`] (`PathEscape`) if `name` is
    /// absolute or contains a parent-directory component.
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        let candidate = Path::new(name);
        if candidate.is_absolute()
            || candidate
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(SafetyViolation::PathEscape(name.to_owned()).into());
        }
        Ok(self.root.join(candidate))
    }

    /// Serialize `value` canonically, hash it, and write both the content
    /// file and its `.sha256` side-file atomically.
    ///
    /// If `name` already exists, the existing content's hash is compared
    /// against the new content's hash: identical content is a silent
    /// no-op, differing content is rejected as a
    /// [`SafetyViolation::ContentHashCollision`] — this store never
    /// silently overwrites an existing artifact with different bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SafetyViolation`] (`PathEscape`,
    /// `ContentHashCollision`) or [`Error::Io`].
    pub fn write<T: Serialize>(&self, name: &str, value: &T) -> Result<String> {
        let path = self.resolve(name)?;
        let bytes = canonical_json_bytes(value)?;
        let digest = sha256_hex(&bytes);

        if path.exists() {
            let existing = fs::read(&path).map_err(|e| Error::io(path.display().to_string(), e))?;
            let existing_digest = sha256_hex(&existing);
            if existing_digest != digest {
                return Err(SafetyViolation::ContentHashCollision(name.to_owned()).into());
            }
            return Ok(digest);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent.display().to_string(), e))?;
        }

        atomic_write(&path, &bytes)?;
        atomic_write(&path.with_extension("sha256"), digest.as_bytes())?;
        Ok(digest)
    }

    /// Read and deserialize `name`, verifying it against its `.sha256`
    /// side-file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SafetyViolation`] (`PathEscape`, `HashMismatch`),
    /// [`Error::Io`], or [`Error::InvalidInput`] if the content does not
    /// deserialize as `T`.
    pub fn read<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<T> {
        let path = self.resolve(name)?;
        let bytes = fs::read(&path).map_err(|e| Error::io(path.display().to_string(), e))?;

        let sha_path = path.with_extension("sha256");
        if let Ok(expected) = fs::read_to_string(&sha_path) {
            let actual = sha256_hex(&bytes);
            let expected = expected.trim();
            if expected != actual {
                return Err(SafetyViolation::HashMismatch {
                    expected: expected.to_owned(),
                    actual,
                }
                .into());
            }
        }

        serde_json::from_slice(&bytes)
            .map_err(|e| Error::InvalidInput(format!("failed to parse '{name}': {e}")))
    }

    /// Whether `name` exists in the store.
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.resolve(name).map(|p| p.exists()).unwrap_or(false)
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| Error::io(dir.display().to_string(), e))?;
    tmp.write_all(bytes)
        .map_err(|e| Error::io(path.display().to_string(), e))?;
    tmp.persist(path)
        .map_err(|e| Error::io(path.display().to_string(), e.error))?;
    Ok(())
}
