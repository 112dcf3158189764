//! Idempotency records.
//!
//! Every mutating operation first consults `IDEM + request_uuid + op_tag`;
//! a hit short-circuits to the cached serialized response, so replays after
//! `MaybeCommitted` never re-apply side effects.

use flamefs_kv::{ReadOnlyTransaction, ReadWriteTransaction};
use flamefs_schema as schema;
use flamefs_types::{Result, Status, StatusCode, Uuid};

/// Load a previously stored result for `(request, op_tag)`.
pub async fn load<T, R>(txn: &mut T, request: Uuid, op_tag: &str) -> Result<Option<R>>
where
    T: ReadOnlyTransaction + ?Sized,
    R: serde::de::DeserializeOwned,
{
    if request.is_zero() {
        return Ok(None);
    }
    let key = schema::idempotent_key(request, op_tag);
    match txn.get(&key).await? {
        Some(raw) => {
            let value = serde_json::from_slice(&raw).map_err(|e| {
                Status::with_message(
                    StatusCode::DATA_CORRUPTION,
                    format!("idempotent record for {}: {}", op_tag, e),
                )
            })?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Stage the result of a mutating operation; committed together with the
/// operation's writes, so the record exists exactly when the effects do.
pub async fn store<R>(
    txn: &mut dyn ReadWriteTransaction,
    request: Uuid,
    op_tag: &str,
    result: &R,
) -> Result<()>
where
    R: serde::Serialize,
{
    if request.is_zero() {
        return Ok(());
    }
    let raw = serde_json::to_vec(result).map_err(|e| {
        Status::with_message(
            StatusCode::DATA_CORRUPTION,
            format!("serialize idempotent record for {}: {}", op_tag, e),
        )
    })?;
    txn.set(&schema::idempotent_key(request, op_tag), &raw).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use flamefs_kv::KvEngine;
    use flamefs_kv_backends::MemKvEngine;

    #[tokio::test]
    async fn test_store_then_load() {
        let engine = MemKvEngine::new();
        let request = Uuid::new(1, 2);

        let mut txn = engine.create_readwrite_transaction();
        store(&mut txn, request, "create", &"result".to_string())
            .await
            .unwrap();
        txn.commit().await.unwrap();

        let mut txn = engine.create_readwrite_transaction();
        let hit: Option<String> = load(&mut txn, request, "create").await.unwrap();
        assert_eq!(hit.as_deref(), Some("result"));

        // Same uuid under a different op tag is a different record.
        let miss: Option<String> = load(&mut txn, request, "remove").await.unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn test_zero_uuid_never_recorded() {
        let engine = MemKvEngine::new();
        let mut txn = engine.create_readwrite_transaction();
        store(&mut txn, Uuid::ZERO, "create", &1u32).await.unwrap();
        txn.commit().await.unwrap();
        assert!(engine.is_empty());

        let mut txn = engine.create_readwrite_transaction();
        let hit: Option<u32> = load(&mut txn, Uuid::ZERO, "create").await.unwrap();
        assert!(hit.is_none());
    }
}
