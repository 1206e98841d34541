//! `kv`: bucketed key/value storage. Bucket paths nest with `:`.

use std::{collections::BTreeMap, sync::Arc};

use mlua::{Lua, Value};
use parking_lot::RwLock;

use super::BoxError;
use crate::{
    bridge::{self, Surface},
    engine::Module,
};

pub const BUCKET_DELIMITER: char = ':';

pub trait KvStore: Send + Sync + 'static {
    /// # Errors
    /// Returns a backend error.
    fn get(&self, bucket: &str, key: &str) -> Result<Option<String>, BoxError>;
    /// # Errors
    /// Returns a backend error.
    fn put(&self, bucket: &str, key: &str, value: &str) -> Result<(), BoxError>;
    /// # Errors
    /// Returns a backend error.
    fn keys(&self, bucket: &str) -> Result<Vec<String>, BoxError>;
    /// Removes `bucket` and every bucket nested below it.
    ///
    /// # Errors
    /// Returns a backend error.
    fn drop_bucket(&self, bucket: &str) -> Result<(), BoxError>;
}

/// Checks that a bucket path has no empty segments.
///
/// # Errors
/// Returns an error naming the bad path.
pub fn validate_bucket(bucket: &str) -> Result<(), BoxError> {
    if bucket.split(BUCKET_DELIMITER).any(str::is_empty) {
        return Err(format!("invalid bucket path '{bucket}'").into());
    }
    Ok(())
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryKv {
    buckets: RwLock<BTreeMap<String, BTreeMap<String, String>>>,
}

impl MemoryKv {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, bucket: &str, key: &str) -> Result<Option<String>, BoxError> {
        validate_bucket(bucket)?;
        Ok(self
            .buckets
            .read()
            .get(bucket)
            .and_then(|b| b.get(key))
            .cloned())
    }

    fn put(&self, bucket: &str, key: &str, value: &str) -> Result<(), BoxError> {
        validate_bucket(bucket)?;
        self.buckets
            .write()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn keys(&self, bucket: &str) -> Result<Vec<String>, BoxError> {
        validate_bucket(bucket)?;
        Ok(self
            .buckets
            .read()
            .get(bucket)
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn drop_bucket(&self, bucket: &str) -> Result<(), BoxError> {
        validate_bucket(bucket)?;
        let nested = format!("{bucket}{BUCKET_DELIMITER}");
        self.buckets
            .write()
            .retain(|name, _| name != bucket && !name.starts_with(&nested));
        Ok(())
    }
}

struct KvHandle(Arc<dyn KvStore>);

fn surface() -> Surface<KvHandle> {
    Surface::new()
        .method("get", |_, kv: &KvHandle, (bucket, key): (String, String)| {
            kv.0.get(&bucket, &key).map_err(mlua::Error::external)
        })
        .method(
            "put",
            |_, kv: &KvHandle, (bucket, key, value): (String, String, String)| {
                kv.0.put(&bucket, &key, &value)
                    .map_err(mlua::Error::external)
            },
        )
        .method("keys", |_, kv: &KvHandle, bucket: String| {
            kv.0.keys(&bucket).map_err(mlua::Error::external)
        })
        .method("drop", |_, kv: &KvHandle, bucket: String| {
            kv.0.drop_bucket(&bucket).map_err(mlua::Error::external)
        })
}

/// The `kv` global backed by `store`.
pub fn module(store: Arc<dyn KvStore>) -> impl Module {
    move |lua: &Lua| {
        bridge::class(lua, "KV", Arc::new(KvHandle(store.clone())), surface).map(Value::UserData)
    }
}
