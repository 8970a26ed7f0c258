//! Content-addressed artifact store
//!
//! Submitted source code is persisted at
//! `<staging-root>/<fingerprint>/<code_file>` and reused by every later
//! request with the same language and code. Artifacts are never rewritten.

use moka::future::Cache;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::registry::LanguageSpec;

/// Cache key derived from a language identifier and source text
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash `language` and `code` into a fingerprint.
///
/// The language is length-prefixed so that `("ab", "c")` and `("a", "bc")`
/// hash differently.
pub fn fingerprint(language: &str, code: &str) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update((language.len() as u64).to_be_bytes());
    hasher.update(language.as_bytes());
    hasher.update(code.as_bytes());
    Fingerprint(hex::encode(hasher.finalize()))
}

/// A persisted source file
#[derive(Debug, Clone)]
pub struct Artifact {
    pub fingerprint: Fingerprint,
    /// Directory bind-mounted into the sandbox
    pub dir: PathBuf,
    /// Full path of the source file inside `dir`
    pub source_path: PathBuf,
    /// True when this call wrote the file
    pub created: bool,
}

/// On-disk artifact store
#[derive(Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    /// Per-fingerprint write locks. Never evicted by size; an entry is
    /// dropped once its artifact is on disk.
    locks: Cache<Fingerprint, Arc<Mutex<()>>>,
}

impl ArtifactStore {
    /// Open the store, creating the staging root if needed.
    ///
    /// The root is canonicalized because artifact directories are used as
    /// bind-mount sources, which must be absolute.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        tokio::fs::create_dir_all(root).await.map_err(write_err(root))?;
        let root = tokio::fs::canonicalize(root).await?;
        info!("Artifact store at {}", root.display());

        Ok(ArtifactStore {
            root,
            locks: Cache::builder().build(),
        })
    }

    /// Staging root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Return the artifact for `fingerprint`, writing `code` on first use.
    pub async fn ensure_artifact(
        &self,
        fingerprint: &Fingerprint,
        spec: &LanguageSpec,
        code: &str,
    ) -> Result<Artifact> {
        let dir = self.root.join(fingerprint.as_str());
        let source_path = dir.join(&spec.code_file);

        if exists(&source_path).await? {
            debug!("artifact hit: {}", fingerprint);
            return Ok(self.artifact(fingerprint, dir, source_path, false));
        }

        if spec.requires_build() {
            return Err(Error::BuildRequired(spec.name.clone()));
        }

        let lock = self
            .locks
            .get_with(fingerprint.clone(), async { Arc::new(Mutex::new(())) })
            .await;
        let _guard = lock.lock().await;

        // Another writer may have finished while we waited
        if exists(&source_path).await? {
            debug!("artifact written concurrently: {}", fingerprint);
            return Ok(self.artifact(fingerprint, dir, source_path, false));
        }

        write_atomic(&dir, &source_path, code.as_bytes()).await?;
        // Waiters still holding this lock re-check and see the file
        self.locks.invalidate(fingerprint).await;
        info!("artifact stored: {} ({} bytes)", fingerprint, code.len());

        Ok(self.artifact(fingerprint, dir, source_path, true))
    }

    fn artifact(
        &self,
        fingerprint: &Fingerprint,
        dir: PathBuf,
        source_path: PathBuf,
        created: bool,
    ) -> Artifact {
        Artifact {
            fingerprint: fingerprint.clone(),
            dir,
            source_path,
            created,
        }
    }
}

async fn exists(path: &Path) -> Result<bool> {
    tokio::fs::try_exists(path).await.map_err(write_err(path))
}

fn write_err(path: &Path) -> impl FnOnce(std::io::Error) -> Error {
    let path = path.to_path_buf();
    move |source| Error::ArtifactWrite { path, source }
}

/// Write into a temp file in `dir`, then rename over `target`
async fn write_atomic(dir: &Path, target: &Path, contents: &[u8]) -> Result<()> {
    tokio::fs::create_dir_all(dir).await.map_err(write_err(dir))?;

    let tmp = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
    if let Err(e) = tokio::fs::write(&tmp, contents).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(write_err(&tmp)(e));
    }
    if let Err(e) = tokio::fs::rename(&tmp, target).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(write_err(target)(e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn python() -> LanguageSpec {
        LanguageSpec {
            name: "Python 3".to_string(),
            docker_image: "python:3.12-slim".to_string(),
            build_cmd: vec![],
            run_cmd: vec!["python3".to_string(), "main.py".to_string()],
            code_file: "main.py".to_string(),
        }
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = fingerprint("python3", "print('x')");
        let b = fingerprint("python3", "print('x')");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert_ne!(a, fingerprint("python3", "print('y')"));
        assert_ne!(a, fingerprint("node", "print('x')"));
    }

    #[test]
    fn test_fingerprint_field_boundary() {
        assert_ne!(fingerprint("ab", "c"), fingerprint("a", "bc"));
        assert_ne!(fingerprint("", "abc"), fingerprint("abc", ""));
    }

    #[tokio::test]
    async fn test_ensure_artifact_writes_once() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(tmp.path().join("staging")).await.unwrap();
        let spec = python();
        let fp = fingerprint("python3", "print('x')");

        let first = store.ensure_artifact(&fp, &spec, "print('x')").await.unwrap();
        assert!(first.created);
        assert!(first.dir.is_absolute());
        assert_eq!(first.source_path, first.dir.join("main.py"));
        let modified = std::fs::metadata(&first.source_path).unwrap().modified().unwrap();

        let second = store.ensure_artifact(&fp, &spec, "print('x')").await.unwrap();
        assert!(!second.created);
        assert_eq!(second.source_path, first.source_path);
        assert_eq!(
            std::fs::read_to_string(&second.source_path).unwrap(),
            "print('x')"
        );
        assert_eq!(
            std::fs::metadata(&second.source_path).unwrap().modified().unwrap(),
            modified
        );
    }

    #[tokio::test]
    async fn test_existing_artifact_is_not_overwritten() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(tmp.path()).await.unwrap();
        let spec = python();
        let fp = fingerprint("python3", "print(1)");

        store.ensure_artifact(&fp, &spec, "print(1)").await.unwrap();
        let again = store.ensure_artifact(&fp, &spec, "something else").await.unwrap();
        assert!(!again.created);
        assert_eq!(std::fs::read_to_string(&again.source_path).unwrap(), "print(1)");
    }

    #[tokio::test]
    async fn test_build_required() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(tmp.path()).await.unwrap();
        let mut spec = python();
        spec.name = "C".to_string();
        spec.build_cmd = vec!["gcc".to_string(), "main.c".to_string()];
        let fp = fingerprint("c", "int main(){}");

        let err = store.ensure_artifact(&fp, &spec, "int main(){}").await.unwrap_err();
        assert!(matches!(err, Error::BuildRequired(_)));
        assert!(!store.root().join(fp.as_str()).exists());
    }

    #[tokio::test]
    async fn test_concurrent_first_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(tmp.path()).await.unwrap();
        let spec = python();
        let code = "print('same')";
        let fp = fingerprint("python3", code);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                let spec = spec.clone();
                let fp = fp.clone();
                tokio::spawn(async move { store.ensure_artifact(&fp, &spec, code).await })
            })
            .collect();

        let mut created = 0;
        for task in tasks {
            if task.await.unwrap().unwrap().created {
                created += 1;
            }
        }
        assert_eq!(created, 1);

        let dir = store.root().join(fp.as_str());
        let entries: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
        assert_eq!(entries.len(), 1, "no temp files left behind");
        assert_eq!(std::fs::read_to_string(dir.join("main.py")).unwrap(), code);

        store.locks.run_pending_tasks().await;
        assert_eq!(store.locks.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_lock_released_after_write() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(tmp.path()).await.unwrap();
        let spec = python();

        for i in 0..50 {
            let code = format!("print({})", i);
            let fp = fingerprint("python3", &code);
            assert!(store.ensure_artifact(&fp, &spec, &code).await.unwrap().created);
        }

        store.locks.run_pending_tasks().await;
        assert_eq!(store.locks.entry_count(), 0);

        // a later request for the same code is a plain hit
        let fp = fingerprint("python3", "print(7)");
        assert!(!store.ensure_artifact(&fp, &spec, "print(7)").await.unwrap().created);
    }
}
