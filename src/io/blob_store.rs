use crate::types::{SegError, SegResult};
use regex::Regex;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tempfile::NamedTempFile;

/// Object storage addressed by (bucket, key)
pub trait BlobStore: Send + Sync {
    /// Download an object to a local file
    fn get(&self, bucket: &str, key: &str, destination: &Path) -> SegResult<()>;

    /// Upload a local file as an object
    fn put(&self, bucket: &str, key: &str, source: &Path) -> SegResult<()>;

    /// All keys starting with `prefix`, sorted
    fn list(&self, bucket: &str, prefix: &str) -> SegResult<Vec<String>>;
}

/// Blob store backed by a directory tree: `<root>/<bucket>/<key>`
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new<P: AsRef<Path>>(root: P) -> SegResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        log::debug!("Local blob store rooted at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, bucket: &str, key: &str) -> SegResult<PathBuf> {
        if bucket.is_empty() || key.is_empty() {
            return Err(SegError::BlobStore(format!(
                "Empty bucket or key: '{}' / '{}'",
                bucket, key
            )));
        }
        let relative = Path::new(bucket).join(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes {
            return Err(SegError::BlobStore(format!(
                "Key '{}' in bucket '{}' is not a plain relative path",
                key, bucket
            )));
        }
        Ok(self.root.join(relative))
    }

    fn collect_keys(dir: &Path, base: &Path, keys: &mut Vec<String>) -> SegResult<()> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                Self::collect_keys(&path, base, keys)?;
            } else if let Ok(relative) = path.strip_prefix(base) {
                let key: Vec<String> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                keys.push(key.join("/"));
            }
        }
        Ok(())
    }
}

impl BlobStore for LocalBlobStore {
    fn get(&self, bucket: &str, key: &str, destination: &Path) -> SegResult<()> {
        let object = self.object_path(bucket, key)?;
        if !object.is_file() {
            return Err(SegError::BlobStore(format!(
                "No object '{}' in bucket '{}'",
                key, bucket
            )));
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&object, destination)?;
        log::debug!("Fetched {}/{} to {}", bucket, key, destination.display());
        Ok(())
    }

    fn put(&self, bucket: &str, key: &str, source: &Path) -> SegResult<()> {
        let object = self.object_path(bucket, key)?;
        if let Some(parent) = object.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(source, &object)?;
        log::debug!("Stored {} as {}/{}", source.display(), bucket, key);
        Ok(())
    }

    fn list(&self, bucket: &str, prefix: &str) -> SegResult<Vec<String>> {
        let base = self.root.join(bucket);
        let mut keys = Vec::new();
        if base.is_dir() {
            Self::collect_keys(&base, &base, &mut keys)?;
        }
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

/// `scheme://bucket/key` location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobUrl {
    pub bucket: String,
    pub key: String,
}

impl BlobUrl {
    pub fn parse(url: &str) -> SegResult<Self> {
        let rest = url
            .split_once("://")
            .map(|(_, rest)| rest)
            .ok_or_else(|| SegError::Config(format!("'{}' is not a bucket URL", url)))?;
        let (bucket, key) = rest
            .split_once('/')
            .ok_or_else(|| SegError::Config(format!("'{}' has no key", url)))?;
        let key = key.trim_start_matches('/');
        if bucket.is_empty() || key.is_empty() {
            return Err(SegError::Config(format!("'{}' has an empty bucket or key", url)));
        }
        Ok(Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }
}

/// Kind of model snapshot a key refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    /// End of a numbered phase
    Phase(usize),
    /// Mid-phase checkpoint of the last phase
    Checkpoint(usize),
    /// Final trained model
    Final,
}

/// Key layout of everything a run persists: `{prefix}/{identity}/...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactKeys {
    prefix: String,
    identity: String,
}

impl ArtifactKeys {
    pub fn new(prefix: &str, identity: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
            identity: identity.to_string(),
        }
    }

    /// Directory-like prefix of this run, with trailing slash
    pub fn run_prefix(&self) -> String {
        format!("{}/{}/", self.prefix, self.identity)
    }

    pub fn phase(&self, phase: usize) -> String {
        format!("{}deeplab_{}.pth", self.run_prefix(), phase)
    }

    pub fn checkpoint(&self, epoch: usize) -> String {
        format!("{}deeplab_checkpoint_{}.pth", self.run_prefix(), epoch)
    }

    pub fn final_model(&self) -> String {
        format!("{}deeplab.pth", self.run_prefix())
    }

    pub fn training_args(&self) -> String {
        format!("{}deeplab_training_args.txt", self.run_prefix())
    }

    pub fn evaluations(&self) -> String {
        format!("{}evaluations.txt", self.run_prefix())
    }

    pub fn predictions(&self) -> String {
        format!("{}predictions.npy", self.run_prefix())
    }

    pub fn ground_truth(&self) -> String {
        format!("{}ground_truth.npy", self.run_prefix())
    }

    /// Classify a snapshot key by its file name
    pub fn classify(key: &str) -> Option<SnapshotKind> {
        static SNAPSHOT: OnceLock<Option<Regex>> = OnceLock::new();
        let pattern = SNAPSHOT
            .get_or_init(|| Regex::new(r"(^|/)deeplab(_(checkpoint_)?(\d+))?\.pth$").ok())
            .as_ref()?;

        let cap = pattern.captures(key)?;
        match cap.get(4) {
            None => Some(SnapshotKind::Final),
            Some(number) => {
                let number = number.as_str().parse().ok()?;
                if cap.get(3).is_some() {
                    Some(SnapshotKind::Checkpoint(number))
                } else {
                    Some(SnapshotKind::Phase(number))
                }
            }
        }
    }
}

/// One run's view of the blob store: a bucket, its key layout and a local
/// scratch directory for files on their way in or out
#[derive(Clone)]
pub struct RunStore {
    store: Arc<dyn BlobStore>,
    bucket: String,
    keys: ArtifactKeys,
    scratch: PathBuf,
}

impl RunStore {
    pub fn new<P: AsRef<Path>>(
        store: Arc<dyn BlobStore>,
        bucket: &str,
        keys: ArtifactKeys,
        scratch: P,
    ) -> SegResult<Self> {
        let scratch = scratch.as_ref().to_path_buf();
        fs::create_dir_all(&scratch)?;
        Ok(Self {
            store,
            bucket: bucket.to_string(),
            keys,
            scratch,
        })
    }

    pub fn keys(&self) -> &ArtifactKeys {
        &self.keys
    }

    pub fn scratch(&self) -> &Path {
        &self.scratch
    }

    /// Temporary file in the scratch directory, removed when dropped
    pub fn scratch_file(&self, suffix: &str) -> SegResult<NamedTempFile> {
        Ok(tempfile::Builder::new()
            .prefix("geoseg-")
            .suffix(suffix)
            .tempfile_in(&self.scratch)?)
    }

    pub fn upload(&self, source: &Path, key: &str) -> SegResult<()> {
        log::info!("Uploading {} to {}/{}", source.display(), self.bucket, key);
        self.store.put(&self.bucket, key, source)
    }

    pub fn download(&self, key: &str, destination: &Path) -> SegResult<()> {
        log::info!("Downloading {}/{} to {}", self.bucket, key, destination.display());
        self.store.get(&self.bucket, key, destination)
    }

    /// Every key stored under this run's prefix
    pub fn list_run(&self) -> SegResult<Vec<String>> {
        self.store.list(&self.bucket, &self.keys.run_prefix())
    }
}

impl std::fmt::Debug for RunStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunStore")
            .field("bucket", &self.bucket)
            .field("keys", &self.keys)
            .field("scratch", &self.scratch)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_blob_url_parsing() {
        let url = BlobUrl::parse("s3://imagery/landsat/mul.tif").unwrap();
        assert_eq!(url.bucket, "imagery");
        assert_eq!(url.key, "landsat/mul.tif");
        assert!(BlobUrl::parse("imagery/mul.tif").is_err());
        assert!(BlobUrl::parse("s3://imagery").is_err());
    }

    #[test]
    fn test_key_layout() {
        let keys = ArtifactKeys::new("runs/", "abc");
        assert_eq!(keys.phase(2), "runs/abc/deeplab_2.pth");
        assert_eq!(keys.checkpoint(10), "runs/abc/deeplab_checkpoint_10.pth");
        assert_eq!(keys.training_args(), "runs/abc/deeplab_training_args.txt");
        assert_eq!(keys.evaluations(), "runs/abc/evaluations.txt");

        assert_eq!(ArtifactKeys::classify(&keys.phase(2)), Some(SnapshotKind::Phase(2)));
        assert_eq!(
            ArtifactKeys::classify(&keys.checkpoint(10)),
            Some(SnapshotKind::Checkpoint(10))
        );
        assert_eq!(ArtifactKeys::classify(&keys.final_model()), Some(SnapshotKind::Final));
        assert_eq!(ArtifactKeys::classify(&keys.training_args()), None);
    }

    #[test]
    fn test_local_store_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(temp_dir.path().join("store")).unwrap();
        let source = temp_dir.path().join("model.pth");
        fs::write(&source, b"weights").unwrap();

        store.put("bucket", "runs/abc/deeplab_0.pth", &source).unwrap();
        store.put("bucket", "runs/abc/deeplab_checkpoint_5.pth", &source).unwrap();
        store.put("bucket", "other/file.txt", &source).unwrap();

        let keys = store.list("bucket", "runs/abc/").unwrap();
        assert_eq!(
            keys,
            vec![
                "runs/abc/deeplab_0.pth".to_string(),
                "runs/abc/deeplab_checkpoint_5.pth".to_string()
            ]
        );

        let destination = temp_dir.path().join("fetched/model.pth");
        store.get("bucket", "runs/abc/deeplab_0.pth", &destination).unwrap();
        assert_eq!(fs::read(&destination).unwrap(), b"weights");

        assert!(store.get("bucket", "missing", &destination).is_err());
        assert!(store.put("bucket", "../escape", &source).is_err());
        assert!(store.list("empty", "").unwrap().is_empty());
    }

    #[test]
    fn test_run_store() {
        let temp_dir = TempDir::new().unwrap();
        let store: Arc<dyn BlobStore> =
            Arc::new(LocalBlobStore::new(temp_dir.path().join("store")).unwrap());
        let run = RunStore::new(
            store,
            "bucket",
            ArtifactKeys::new("runs", "abc"),
            temp_dir.path().join("work"),
        )
        .unwrap();

        let scratch = run.scratch_file(".txt").unwrap();
        fs::write(scratch.path(), b"args").unwrap();
        run.upload(scratch.path(), &run.keys().training_args()).unwrap();
        assert_eq!(
            run.list_run().unwrap(),
            vec!["runs/abc/deeplab_training_args.txt".to_string()]
        );

        let fetched = run.scratch().join("args.txt");
        run.download(&run.keys().training_args(), &fetched).unwrap();
        assert_eq!(fs::read(&fetched).unwrap(), b"args");
    }
}
