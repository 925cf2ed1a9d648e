//! Object-store spool backend (S3/GCS/Azure/local via `object_store`).

use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;
use ftq_common::{FtqError, Result};
use object_store::path::Path;
use object_store::{parse_url, ObjectStore};
use tokio::runtime::Runtime;
use url::Url;

/// Spool backend over an `object_store` bucket/prefix.
///
/// Owns a small current-thread runtime to bridge the async store API into
/// the synchronous [`crate::backend::ExchangeBackend`] contract.
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    base: Path,
    runtime: Runtime,
}

impl ObjectStoreBackend {
    /// Creates a backend from an object-store URL, e.g.
    /// `s3://bucket/exchange-spool` or `file:///tmp/spool`.
    ///
    /// # Errors
    /// Fails for unparseable URLs or unsupported schemes.
    pub fn from_url(url: &str) -> Result<Self> {
        let parsed = Url::parse(url)
            .map_err(|e| FtqError::InvalidConfig(format!("invalid exchange backend url: {e}")))?;
        let (store, base) = parse_url(&parsed)
            .map_err(|e| FtqError::InvalidConfig(format!("unsupported exchange backend: {e}")))?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            store: Arc::from(store),
            base,
            runtime,
        })
    }

    fn full_path(&self, path: &str) -> Path {
        if self.base.as_ref().is_empty() {
            Path::from(path)
        } else {
            Path::from(format!("{}/{path}", self.base))
        }
    }
}

impl crate::backend::ExchangeBackend for ObjectStoreBackend {
    fn put(&self, path: &str, data: &[u8]) -> Result<()> {
        let location = self.full_path(path);
        let payload = Bytes::copy_from_slice(data);
        self.runtime
            .block_on(self.store.put(&location, payload.into()))
            .map_err(|e| FtqError::Execution(format!("object store put failed: {e}")))?;
        Ok(())
    }

    fn get(&self, path: &str) -> Result<Vec<u8>> {
        let location = self.full_path(path);
        let bytes = self
            .runtime
            .block_on(async {
                let result = self.store.get(&location).await?;
                result.bytes().await
            })
            .map_err(|e| FtqError::Execution(format!("object store get failed: {e}")))?;
        Ok(bytes.to_vec())
    }

    fn exists(&self, path: &str) -> Result<bool> {
        let location = self.full_path(path);
        match self.runtime.block_on(self.store.head(&location)) {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(FtqError::Execution(format!(
                "object store head failed: {e}"
            ))),
        }
    }

    fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let location = self.full_path(prefix);
        self.runtime
            .block_on(async {
                let mut listing = self.store.list(Some(&location));
                while let Some(meta) = listing.try_next().await? {
                    self.store.delete(&meta.location).await?;
                }
                Ok::<_, object_store::Error>(())
            })
            .map_err(|e| FtqError::Execution(format!("object store delete failed: {e}")))?;
        Ok(())
    }
}
