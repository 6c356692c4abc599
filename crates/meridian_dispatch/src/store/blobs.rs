use async_trait::async_trait;
use sqlx::Row;

use meridian_ids::BlobId;
use meridian_protocol::worker::BlobMetadata;

use crate::error::Result;

use super::models::{blob_from_row, to_rfc3339};
use super::traits::BlobStore;
use super::Store;

/// Blob descriptors are written by ingress (C2, outside this crate) and
/// read here; the core never mutates bucket contents itself.
#[async_trait]
impl BlobStore for Store {
    async fn get_blob(&self, blob_id: BlobId) -> Result<Option<BlobMetadata>> {
        let row = sqlx::query("SELECT * FROM blobs WHERE blob_id = ?1")
            .bind(blob_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(blob_from_row).transpose()
    }

    async fn put_blob(&self, blob: BlobMetadata) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO blobs (blob_id, bucket, key, content_type, size_bytes, public_url, hash, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(blob_id) DO UPDATE SET
                bucket = excluded.bucket,
                key = excluded.key,
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                public_url = excluded.public_url,
                hash = excluded.hash
            "#,
        )
        .bind(blob.blob_id.to_string())
        .bind(blob.bucket)
        .bind(blob.key)
        .bind(blob.content_type)
        .bind(blob.size_bytes as i64)
        .bind(blob.public_url)
        .bind(blob.hash)
        .bind(to_rfc3339(blob.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
