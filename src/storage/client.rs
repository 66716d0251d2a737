//! S3-compatible object store client.
//!
//! The [ObjectStore] trait is the synchronous facade the remote VFS and the
//! stage manager talk to; the production implementation wraps the AWS SDK
//! client and drives it with the runtime handle captured at startup. Every
//! caller is on a blocking thread (SQLite work always runs under
//! `spawn_blocking`), so blocking on the handle is safe.

use std::sync::{Arc, OnceLock};

use snafu::Snafu;
use tokio::runtime::Handle;

use crate::config::RemoteStageConfig;

#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("object {key} not found"))]
    NotFound { key: String },

    #[snafu(display("object store unavailable: {message}"))]
    Unavailable { message: String },
}

/// The capability set the remote tier is built on. Implementations may block.
pub trait ObjectStore: Send + Sync {
    /// Probe an object; returns its size when it exists.
    fn head(&self, key: &str) -> Result<Option<u64>, StoreError>;

    /// Fetch a whole object.
    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Fetch `bytes=start-end` (inclusive) of an object.
    fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Vec<u8>, StoreError>;

    /// Replace an object with `bytes`.
    fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError>;

    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Enumerate every key in the bucket.
    fn list(&self) -> Result<Vec<String>, StoreError>;
}

/// Enumerate database base names, filtering out the engine's journal/wal/shm
/// artifacts and scratch objects.
pub fn list_databases(store: &dyn ObjectStore) -> Result<Vec<String>, StoreError> {
    let mut names = Vec::new();
    for key in store.list()? {
        if key.contains("temp_")
            || key.ends_with("-journal")
            || key.ends_with("-wal")
            || key.ends_with("-shm")
        {
            continue;
        }
        if let Some(base) = key.strip_suffix(".db") {
            names.push(base.to_string());
        } else if !key.contains('.') && !key.contains('/') {
            names.push(key);
        }
    }
    Ok(names)
}

/// The production store, bound to one bucket.
pub struct RemoteStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    runtime: Handle,
}

static STORE: OnceLock<Arc<RemoteStore>> = OnceLock::new();

/// Connect to the configured bucket and install the process-wide store.
/// The reachability probe is fatal on failure; reinitialization within a run
/// is not supported.
pub async fn init(config: &RemoteStageConfig) -> Result<Arc<RemoteStore>, StoreError> {
    let store = Arc::new(RemoteStore::connect(config).await?);
    Ok(Arc::clone(STORE.get_or_init(|| store)))
}

/// The store installed by [init], if any.
pub fn global() -> Option<Arc<RemoteStore>> {
    STORE.get().cloned()
}

impl RemoteStore {
    pub async fn connect(config: &RemoteStageConfig) -> Result<Self, StoreError> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));
        if !config.access_key.is_empty() {
            loader = loader.credentials_provider(aws_sdk_s3::config::Credentials::new(
                config.access_key.clone(),
                config.secret_key.clone(),
                None,
                None,
                "persisto",
            ));
        }
        if !config.endpoint.is_empty() {
            loader = loader.endpoint_url(config.endpoint.clone());
        }
        let shared = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(true)
            .build();
        let client = aws_sdk_s3::Client::from_conf(s3_config);

        client
            .head_bucket()
            .bucket(&config.bucket)
            .send()
            .await
            .map_err(|err| StoreError::Unavailable {
                message: format!("bucket {} is unreachable: {err}", config.bucket),
            })?;

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            runtime: Handle::current(),
        })
    }

    fn unavailable(err: impl std::fmt::Display) -> StoreError {
        StoreError::Unavailable {
            message: err.to_string(),
        }
    }
}

impl ObjectStore for RemoteStore {
    fn head(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let result = self.runtime.block_on(
            self.client
                .head_object()
                .bucket(&self.bucket)
                .key(key)
                .send(),
        );
        match result {
            Ok(out) => Ok(Some(out.content_length().unwrap_or(0) as u64)),
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(|service| service.is_not_found())
                {
                    Ok(None)
                } else {
                    Err(Self::unavailable(err))
                }
            }
        }
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.runtime.block_on(async {
            let out = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|err| {
                    if err
                        .as_service_error()
                        .is_some_and(|service| service.is_no_such_key())
                    {
                        StoreError::NotFound {
                            key: key.to_string(),
                        }
                    } else {
                        Self::unavailable(err)
                    }
                })?;
            let data = out.body.collect().await.map_err(Self::unavailable)?;
            Ok(data.into_bytes().to_vec())
        })
    }

    fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Vec<u8>, StoreError> {
        self.runtime.block_on(async {
            let out = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .range(format!("bytes={start}-{end}"))
                .send()
                .await
                .map_err(|err| {
                    if err
                        .as_service_error()
                        .is_some_and(|service| service.is_no_such_key())
                    {
                        StoreError::NotFound {
                            key: key.to_string(),
                        }
                    } else {
                        Self::unavailable(err)
                    }
                })?;
            let data = out.body.collect().await.map_err(Self::unavailable)?;
            Ok(data.into_bytes().to_vec())
        })
    }

    fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.runtime
            .block_on(
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .body(bytes.into())
                    .send(),
            )
            .map_err(Self::unavailable)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.runtime
            .block_on(
                self.client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send(),
            )
            .map_err(Self::unavailable)?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut request = self.client.list_objects_v2().bucket(&self.bucket);
            if let Some(token) = &token {
                request = request.continuation_token(token);
            }
            let out = self
                .runtime
                .block_on(request.send())
                .map_err(Self::unavailable)?;
            for object in out.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }
            match out.next_continuation_token() {
                Some(next) => token = Some(next.to_string()),
                None => break,
            }
        }
        Ok(keys)
    }
}

/// A store backed by a plain map, shared by the unit tests of the remote
/// tier.
#[cfg(test)]
pub(crate) struct FakeStore {
    pub objects: std::sync::Mutex<std::collections::BTreeMap<String, Vec<u8>>>,
    pub fail_puts: std::sync::Mutex<bool>,
    pub put_count: std::sync::Mutex<usize>,
}

#[cfg(test)]
impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            objects: Default::default(),
            fail_puts: Default::default(),
            put_count: Default::default(),
        })
    }
}

#[cfg(test)]
impl ObjectStore for FakeStore {
    fn head(&self, key: &str) -> Result<Option<u64>, StoreError> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .map(|data| data.len() as u64))
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })
    }

    fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Vec<u8>, StoreError> {
        let data = self.get(key)?;
        let start = start as usize;
        let end = ((end + 1) as usize).min(data.len());
        Ok(data.get(start..end).unwrap_or_default().to_vec())
    }

    fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        if *self.fail_puts.lock().unwrap() {
            return Err(StoreError::Unavailable {
                message: "injected put failure".to_string(),
            });
        }
        *self.put_count.lock().unwrap() += 1;
        self.objects.lock().unwrap().insert(key.to_string(), bytes);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.objects.lock().unwrap().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct KeysOnly(Vec<&'static str>);

    impl ObjectStore for KeysOnly {
        fn head(&self, _key: &str) -> Result<Option<u64>, StoreError> {
            unimplemented!()
        }
        fn get(&self, _key: &str) -> Result<Vec<u8>, StoreError> {
            unimplemented!()
        }
        fn get_range(&self, _key: &str, _start: u64, _end: u64) -> Result<Vec<u8>, StoreError> {
            unimplemented!()
        }
        fn put(&self, _key: &str, _bytes: Vec<u8>) -> Result<(), StoreError> {
            unimplemented!()
        }
        fn delete(&self, _key: &str) -> Result<(), StoreError> {
            unimplemented!()
        }
        fn list(&self) -> Result<Vec<String>, StoreError> {
            Ok(self.0.iter().map(|s| s.to_string()).collect())
        }
    }

    #[test]
    fn listing_filters_engine_artifacts() {
        let store = KeysOnly(vec![
            "users.db",
            "users.db-journal",
            "orders.db-wal",
            "orders.db-shm",
            "temp_3c6d.db",
            "inventory",
            "backup.tar.gz",
            "nested/key",
            "orders.db",
        ]);
        let mut names = list_databases(&store).unwrap();
        names.sort();
        assert_eq!(names, vec!["inventory", "orders", "users"]);
    }
}
