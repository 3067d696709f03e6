use crate::domain::records::{BusinessKey, Fields};
use crate::infrastructure::store::{matches_filter, Document, DownstreamStore, StoreError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde_json::Value;
use std::collections::HashMap;
use tracing::info;

/// Marker field so that documents with no fields still exist as a hash.
const KEY_FIELD: &str = "__key";

/// Documents are hashes at `{namespace}:{collection}:{key}` with JSON-encoded
/// values. Each collection keeps a set of its keys for `query`.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    namespace: String,
}

impl RedisStore {
    pub async fn connect(redis_url: &str, namespace: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Invalid Redis URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        info!("Connected to Redis document store");
        Ok(Self {
            conn,
            namespace: namespace.into(),
        })
    }

    fn document_key(&self, collection: &str, key: &BusinessKey) -> String {
        format!("{}:{}:{}", self.namespace, collection, key)
    }

    fn index_key(&self, collection: &str) -> String {
        format!("{}:{}:__keys", self.namespace, collection)
    }

    fn encode(key: &BusinessKey, fields: &Fields) -> Result<Vec<(String, String)>, StoreError> {
        let mut pairs = Vec::with_capacity(fields.len() + 1);
        pairs.push((KEY_FIELD.to_string(), serde_json::to_string(key.as_str())?));
        for (name, value) in fields {
            pairs.push((name.clone(), serde_json::to_string(value)?));
        }
        Ok(pairs)
    }

    fn decode(raw: HashMap<String, String>) -> Result<Option<Fields>, StoreError> {
        if raw.is_empty() {
            return Ok(None);
        }
        let mut fields = Fields::new();
        for (name, encoded) in raw {
            if name == KEY_FIELD {
                continue;
            }
            let value: Value = serde_json::from_str(&encoded)
                .map_err(|e| StoreError::Corrupt(format!("field {}: {}", name, e)))?;
            fields.insert(name, value);
        }
        Ok(Some(fields))
    }
}

#[async_trait]
impl DownstreamStore for RedisStore {
    async fn upsert(
        &self,
        collection: &str,
        key: &BusinessKey,
        fields: Fields,
    ) -> Result<(), StoreError> {
        let pairs = Self::encode(key, &fields)?;
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(self.document_key(collection, key))
            .arg(pairs)
            .ignore()
            .cmd("SADD")
            .arg(self.index_key(collection))
            .arg(key.as_str())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, collection: &str, key: &BusinessKey) -> Result<Option<Fields>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.document_key(collection, key))
            .query_async(&mut conn)
            .await?;
        Self::decode(raw)
    }

    async fn conditional_insert(
        &self,
        collection: &str,
        key: &BusinessKey,
        fields: Fields,
    ) -> Result<bool, StoreError> {
        let script = redis::Script::new(
            r#"
            if redis.call("EXISTS", KEYS[1]) == 1 then
                return 0
            end
            redis.call("HSET", KEYS[1], unpack(ARGV, 2))
            redis.call("SADD", KEYS[2], ARGV[1])
            return 1
            "#,
        );

        let pairs = Self::encode(key, &fields)?;
        let mut conn = self.conn.clone();
        let inserted: i32 = script
            .key(self.document_key(collection, key))
            .key(self.index_key(collection))
            .arg(key.as_str())
            .arg(pairs)
            .invoke_async(&mut conn)
            .await?;
        Ok(inserted == 1)
    }

    async fn delete(&self, collection: &str, key: &BusinessKey) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(self.document_key(collection, key))
            .ignore()
            .cmd("SREM")
            .arg(self.index_key(collection))
            .arg(key.as_str())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete_if(
        &self,
        collection: &str,
        key: &BusinessKey,
        expected: &Fields,
    ) -> Result<bool, StoreError> {
        // ARGV[1] is the index member, then field/encoded-value pairs.
        let script = redis::Script::new(
            r#"
            if redis.call("EXISTS", KEYS[1]) == 0 then
                return 0
            end
            for i = 2, #ARGV, 2 do
                if redis.call("HGET", KEYS[1], ARGV[i]) ~= ARGV[i + 1] then
                    return 0
                end
            end
            redis.call("DEL", KEYS[1])
            redis.call("SREM", KEYS[2], ARGV[1])
            return 1
            "#,
        );

        let mut pairs = Vec::with_capacity(expected.len());
        for (name, value) in expected {
            pairs.push((name.clone(), serde_json::to_string(value)?));
        }
        let mut conn = self.conn.clone();
        let deleted: i32 = script
            .key(self.document_key(collection, key))
            .key(self.index_key(collection))
            .arg(key.as_str())
            .arg(pairs)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn increment(
        &self,
        collection: &str,
        key: &BusinessKey,
        field: &str,
        delta: i64,
    ) -> Result<i64, StoreError> {
        // JSON-encoded integers are plain decimal strings, so HINCRBY applies.
        let document_key = self.document_key(collection, key);
        let mut conn = self.conn.clone();
        let (value,): (i64,) = redis::pipe()
            .atomic()
            .cmd("HSETNX")
            .arg(&document_key)
            .arg(KEY_FIELD)
            .arg(serde_json::to_string(key.as_str())?)
            .ignore()
            .cmd("HINCRBY")
            .arg(&document_key)
            .arg(field)
            .arg(delta)
            .cmd("SADD")
            .arg(self.index_key(collection))
            .arg(key.as_str())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn query(&self, collection: &str, filter: &Fields) -> Result<Vec<Document>, StoreError> {
        let mut conn = self.conn.clone();
        let mut keys: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.index_key(collection))
            .query_async(&mut conn)
            .await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        keys.sort();

        let mut pipeline = redis::pipe();
        for key in &keys {
            pipeline
                .cmd("HGETALL")
                .arg(self.document_key(collection, &BusinessKey::from_raw(key.as_str())));
        }
        let results: Vec<HashMap<String, String>> = pipeline.query_async(&mut conn).await?;

        let mut documents = Vec::new();
        for (key, raw) in keys.into_iter().zip(results) {
            // Index entries can outlive a document deleted by another writer.
            let Some(fields) = Self::decode(raw)? else {
                continue;
            };
            if matches_filter(&fields, filter) {
                documents.push(Document {
                    key: BusinessKey::from_raw(key),
                    fields,
                });
            }
        }
        Ok(documents)
    }
}
