use crate::models::OcrAudit;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// Local-filesystem blob store. Callers hold only the opaque references
/// this type hands out; nothing outside it touches paths.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

const IMAGE_DIR: &str = "images";
const AUDIT_DIR: &str = "audit";

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the directory layout; run once at startup
    pub async fn init(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(self.root.join(IMAGE_DIR)).await?;
        tokio::fs::create_dir_all(self.root.join(AUDIT_DIR)).await?;
        Ok(())
    }

    /// Persist image bytes; returns a stable reference
    pub async fn store_image(&self, bytes: &[u8], extension: &str) -> io::Result<String> {
        let reference = format!("{}/{}.{}", IMAGE_DIR, Uuid::new_v4(), extension);
        tokio::fs::write(self.root.join(&reference), bytes).await?;
        Ok(reference)
    }

    /// Read back the bytes behind a reference
    pub async fn read(&self, reference: &str) -> io::Result<Vec<u8>> {
        tokio::fs::read(self.root.join(reference)).await
    }

    pub async fn exists(&self, reference: &str) -> bool {
        tokio::fs::try_exists(self.root.join(reference))
            .await
            .unwrap_or(false)
    }

    /// Delete the object behind a reference; absent objects are fine
    pub async fn delete(&self, reference: &str) -> io::Result<()> {
        match tokio::fs::remove_file(self.root.join(reference)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Write the OCR audit artifact for a receipt
    pub async fn store_audit(&self, receipt_id: Uuid, audit: &OcrAudit) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(audit)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(self.audit_path(receipt_id), json).await
    }

    /// Read the audit artifact; None when it was never written or has
    /// been cleaned up
    pub async fn read_audit(&self, receipt_id: Uuid) -> io::Result<Option<OcrAudit>> {
        match tokio::fs::read(self.audit_path(receipt_id)).await {
            Ok(bytes) => {
                let audit = serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(audit))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn delete_audit(&self, receipt_id: Uuid) -> io::Result<()> {
        match tokio::fs::remove_file(self.audit_path(receipt_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Delete audit artifacts older than the retention window; returns
    /// the number removed
    pub async fn delete_stale_audits(&self, retention_days: i64) -> io::Result<usize> {
        let cutoff = SystemTime::now() - Duration::from_secs(retention_days.max(0) as u64 * 86_400);
        let mut removed = 0usize;
        let mut entries = tokio::fs::read_dir(self.root.join(AUDIT_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = match entry.metadata().await {
                Ok(m) => m,
                Err(_) => continue,
            };
            if !meta.is_file() {
                continue;
            }
            let modified = match meta.modified() {
                Ok(t) => t,
                Err(_) => continue,
            };
            if modified < cutoff {
                if tokio::fs::remove_file(entry.path()).await.is_ok() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    fn audit_path(&self, receipt_id: Uuid) -> PathBuf {
        self.root.join(AUDIT_DIR).join(format!("{}.json", receipt_id))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ParsedReceipt;

    async fn temp_store() -> FileStore {
        let store = FileStore::new(
            std::env::temp_dir().join(format!("receipt-store-{}", Uuid::new_v4())),
        );
        store.init().await.unwrap();
        store
    }

    fn audit_fixture() -> OcrAudit {
        OcrAudit {
            raw_text: "WALMART\nMilk 3.99".into(),
            confidence: 0.82,
            parsed: ParsedReceipt::default(),
        }
    }

    #[tokio::test]
    async fn image_blobs_round_trip_behind_their_reference() {
        let store = temp_store().await;

        let reference = store.store_image(b"not really a jpeg", "jpg").await.unwrap();
        assert!(reference.ends_with(".jpg"));
        assert!(store.exists(&reference).await);
        assert_eq!(store.read(&reference).await.unwrap(), b"not really a jpeg");

        store.delete(&reference).await.unwrap();
        assert!(!store.exists(&reference).await);
        // Deleting again is fine.
        store.delete(&reference).await.unwrap();
    }

    #[tokio::test]
    async fn audit_artifacts_round_trip_and_absent_reads_are_none() {
        let store = temp_store().await;
        let receipt_id = Uuid::new_v4();

        assert!(store.read_audit(receipt_id).await.unwrap().is_none());

        store.store_audit(receipt_id, &audit_fixture()).await.unwrap();
        let read_back = store.read_audit(receipt_id).await.unwrap().unwrap();
        assert_eq!(read_back.raw_text, "WALMART\nMilk 3.99");

        store.delete_audit(receipt_id).await.unwrap();
        assert!(store.read_audit(receipt_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_audit_sweep_respects_the_retention_window() {
        let store = temp_store().await;
        let receipt_id = Uuid::new_v4();
        store.store_audit(receipt_id, &audit_fixture()).await.unwrap();

        // A generous window keeps the fresh artifact.
        assert_eq!(store.delete_stale_audits(30).await.unwrap(), 0);
        assert!(store.read_audit(receipt_id).await.unwrap().is_some());

        // A zero-day window makes everything already written stale.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.delete_stale_audits(0).await.unwrap(), 1);
        assert!(store.read_audit(receipt_id).await.unwrap().is_none());
    }
}
