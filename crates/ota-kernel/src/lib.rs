use anyhow::{anyhow, Result};
use ota_protocol::DeviceStatus;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Durable per-device record and firmware catalog, backed by SQLite plus
/// a content-addressed blob directory for artifact bytes.
#[derive(Clone)]
pub struct Kernel {
    db_path: PathBuf,
    state_dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DeviceRow {
    pub device_id: String,
    pub last_ip: Option<String>,
    pub current_version: Option<String>,
    pub status: String,
    pub last_seen: String,
}

impl DeviceRow {
    /// Classified view of the free-form status column.
    pub fn status(&self) -> DeviceStatus {
        DeviceStatus::parse(&self.status)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FirmwareRow {
    pub id: i64,
    pub file_name: String,
    pub version: String,
    pub hash: String,
    pub size: i64,
    pub created: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("firmware with this file name and version already exists")]
    Duplicate,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

impl Kernel {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join("ota.sqlite");
        let conn = Connection::open(&db_path)?;
        // Pragmas tuned for async server usage
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        // Busy timeout (default 5000ms; override with OTA_SQLITE_BUSY_MS)
        let busy_ms: u64 = std::env::var("OTA_SQLITE_BUSY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);
        conn.busy_timeout(std::time::Duration::from_millis(busy_ms))?;
        let _ = conn.pragma_update(None, "temp_store", "MEMORY");
        Self::init_schema(&conn)?;
        Ok(Self {
            db_path,
            state_dir: dir.to_path_buf(),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
              device_id TEXT PRIMARY KEY,
              last_ip TEXT,
              current_version TEXT,
              status TEXT NOT NULL,
              last_seen TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS firmwares (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              file_name TEXT NOT NULL,
              version TEXT NOT NULL,
              hash TEXT NOT NULL,
              size INTEGER NOT NULL,
              created TEXT NOT NULL,
              UNIQUE(file_name, version)
            );
            CREATE INDEX IF NOT EXISTS idx_firmwares_hash ON firmwares(hash);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<Connection> {
        Ok(Connection::open(&self.db_path)?)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    // ---------------- Devices ----------------

    /// Handshake-time upsert: replaces the whole record.
    pub fn upsert_device(
        &self,
        device_id: &str,
        last_ip: Option<&str>,
        current_version: Option<&str>,
        status: &DeviceStatus,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO devices (device_id, last_ip, current_version, status, last_seen)
             VALUES (?, ?, ?, ?, ?)",
            params![device_id, last_ip, current_version, status.as_wire(), now_rfc3339()],
        )?;
        Ok(())
    }

    /// Status-report update. A `None` version keeps the stored value.
    /// Returns false when no record exists for the identifier.
    pub fn update_device_status(
        &self,
        device_id: &str,
        status: &DeviceStatus,
        version: Option<&str>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE devices SET status = ?, current_version = COALESCE(?, current_version),
             last_seen = ? WHERE device_id = ?",
            params![status.as_wire(), version, now_rfc3339(), device_id],
        )?;
        Ok(n > 0)
    }

    pub fn get_device(&self, device_id: &str) -> Result<Option<DeviceRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT device_id, last_ip, current_version, status, last_seen
             FROM devices WHERE device_id = ? LIMIT 1",
        )?;
        let row = stmt
            .query_row([device_id], |row| {
                Ok(DeviceRow {
                    device_id: row.get(0)?,
                    last_ip: row.get(1)?,
                    current_version: row.get(2)?,
                    status: row.get(3)?,
                    last_seen: row.get(4)?,
                })
            })
            .optional()?;
        Ok(row)
    }

    pub fn list_devices(&self) -> Result<Vec<DeviceRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT device_id, last_ip, current_version, status, last_seen
             FROM devices ORDER BY device_id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(DeviceRow {
                device_id: row.get(0)?,
                last_ip: row.get(1)?,
                current_version: row.get(2)?,
                status: row.get(3)?,
                last_seen: row.get(4)?,
            });
        }
        Ok(out)
    }

    pub fn clear_devices(&self) -> Result<usize> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM devices", [])?;
        Ok(n)
    }

    // ---------------- Firmware catalog ----------------

    pub fn insert_firmware(
        &self,
        file_name: &str,
        version: &str,
        hash: &str,
        size: i64,
    ) -> Result<FirmwareRow, CatalogError> {
        let conn = self.conn().map_err(CatalogError::Other)?;
        let created = now_rfc3339();
        let res = conn.execute(
            "INSERT INTO firmwares (file_name, version, hash, size, created) VALUES (?, ?, ?, ?, ?)",
            params![file_name, version, hash, size, created],
        );
        match res {
            Ok(_) => Ok(FirmwareRow {
                id: conn.last_insert_rowid(),
                file_name: file_name.to_string(),
                version: version.to_string(),
                hash: hash.to_string(),
                size,
                created,
            }),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(CatalogError::Duplicate)
            }
            Err(e) => Err(CatalogError::Other(e.into())),
        }
    }

    /// Latest is insertion order (highest id), never version-string order.
    pub fn latest_firmware(&self) -> Result<Option<FirmwareRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, file_name, version, hash, size, created
             FROM firmwares ORDER BY id DESC LIMIT 1",
        )?;
        let row = stmt.query_row([], Self::firmware_from_row).optional()?;
        Ok(row)
    }

    pub fn get_firmware(&self, id: i64) -> Result<Option<FirmwareRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, file_name, version, hash, size, created
             FROM firmwares WHERE id = ? LIMIT 1",
        )?;
        let row = stmt.query_row([id], Self::firmware_from_row).optional()?;
        Ok(row)
    }

    pub fn list_firmwares(&self) -> Result<Vec<FirmwareRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, file_name, version, hash, size, created
             FROM firmwares ORDER BY id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(Self::firmware_from_row(row)?);
        }
        Ok(out)
    }

    /// Removes the row and reports how many remaining rows still reference
    /// the same blob hash, so callers know whether the bytes can go too.
    pub fn delete_firmware(&self, id: i64) -> Result<Option<(FirmwareRow, i64)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, file_name, version, hash, size, created
             FROM firmwares WHERE id = ? LIMIT 1",
        )?;
        let Some(row) = stmt.query_row([id], Self::firmware_from_row).optional()? else {
            return Ok(None);
        };
        conn.execute("DELETE FROM firmwares WHERE id = ?", [id])?;
        let remaining: i64 = conn.query_row(
            "SELECT COUNT(*) FROM firmwares WHERE hash = ?",
            [row.hash.as_str()],
            |r| r.get(0),
        )?;
        Ok(Some((row, remaining)))
    }

    /// Deletes every row; returns what was removed so blobs can be cleaned up.
    pub fn clear_firmwares(&self) -> Result<Vec<FirmwareRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, file_name, version, hash, size, created FROM firmwares ORDER BY id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(Self::firmware_from_row(row)?);
        }
        conn.execute("DELETE FROM firmwares", [])?;
        Ok(out)
    }

    fn firmware_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FirmwareRow> {
        Ok(FirmwareRow {
            id: row.get(0)?,
            file_name: row.get(1)?,
            version: row.get(2)?,
            hash: row.get(3)?,
            size: row.get(4)?,
            created: row.get(5)?,
        })
    }

    // ---------------- Blob store ----------------

    pub fn blob_path(&self, hash: &str) -> PathBuf {
        self.state_dir.join("blobs").join(format!("{}.bin", hash))
    }

    /// Stores artifact bytes under their sha256. Idempotent for identical
    /// content. Returns the hex digest.
    pub async fn blob_put(&self, bytes: &[u8]) -> Result<String> {
        use sha2::Digest as _;
        let mut h = sha2::Sha256::new();
        h.update(bytes);
        let sha = hex::encode(h.finalize());
        let dir = self.state_dir.join("blobs");
        tokio::fs::create_dir_all(&dir).await?;
        let path = self.blob_path(&sha);
        if tokio::fs::metadata(&path).await.is_err() {
            tokio::fs::write(&path, bytes).await?;
        }
        Ok(sha)
    }

    pub async fn blob_read(&self, hash: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(hash);
        tokio::fs::read(&path)
            .await
            .map_err(|e| anyhow!("read blob {}: {}", hash, e))
    }

    pub async fn blob_remove(&self, hash: &str) -> Result<()> {
        let path = self.blob_path(hash);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // ---------------- Async wrappers (spawn_blocking) ----------------

    pub async fn upsert_device_async(
        &self,
        device_id: &str,
        last_ip: Option<&str>,
        current_version: Option<&str>,
        status: &DeviceStatus,
    ) -> Result<()> {
        let k = self.clone();
        let id = device_id.to_string();
        let ip = last_ip.map(|s| s.to_string());
        let ver = current_version.map(|s| s.to_string());
        let st = status.clone();
        tokio::task::spawn_blocking(move || k.upsert_device(&id, ip.as_deref(), ver.as_deref(), &st))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn update_device_status_async(
        &self,
        device_id: &str,
        status: &DeviceStatus,
        version: Option<&str>,
    ) -> Result<bool> {
        let k = self.clone();
        let id = device_id.to_string();
        let st = status.clone();
        let ver = version.map(|s| s.to_string());
        tokio::task::spawn_blocking(move || k.update_device_status(&id, &st, ver.as_deref()))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn get_device_async(&self, device_id: &str) -> Result<Option<DeviceRow>> {
        let k = self.clone();
        let id = device_id.to_string();
        tokio::task::spawn_blocking(move || k.get_device(&id))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn list_devices_async(&self) -> Result<Vec<DeviceRow>> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.list_devices())
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn clear_devices_async(&self) -> Result<usize> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.clear_devices())
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn insert_firmware_async(
        &self,
        file_name: &str,
        version: &str,
        hash: &str,
        size: i64,
    ) -> Result<FirmwareRow, CatalogError> {
        let k = self.clone();
        let f = file_name.to_string();
        let v = version.to_string();
        let h = hash.to_string();
        tokio::task::spawn_blocking(move || k.insert_firmware(&f, &v, &h, size))
            .await
            .map_err(|e| CatalogError::Other(anyhow!("join error: {}", e)))?
    }

    pub async fn latest_firmware_async(&self) -> Result<Option<FirmwareRow>> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.latest_firmware())
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn get_firmware_async(&self, id: i64) -> Result<Option<FirmwareRow>> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.get_firmware(id))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn list_firmwares_async(&self) -> Result<Vec<FirmwareRow>> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.list_firmwares())
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn delete_firmware_async(&self, id: i64) -> Result<Option<(FirmwareRow, i64)>> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.delete_firmware(id))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn clear_firmwares_async(&self) -> Result<Vec<FirmwareRow>> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.clear_firmwares())
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn kernel() -> (tempfile::TempDir, Kernel) {
        let dir = tempdir().expect("tempdir");
        let kernel = Kernel::open(dir.path()).expect("open kernel");
        (dir, kernel)
    }

    #[test]
    fn device_upsert_and_status_updates_apply_in_order() {
        let (_dir, k) = kernel();
        k.upsert_device(
            "AA:BB:CC:DD:EE:FF",
            Some("10.0.0.7"),
            Some("1.0.0"),
            &DeviceStatus::Connected,
        )
        .unwrap();

        let reports = [
            (DeviceStatus::Downloading, None),
            (DeviceStatus::Installing, None),
            (DeviceStatus::Success, Some("1.1.0")),
        ];
        for (status, version) in &reports {
            assert!(k
                .update_device_status("AA:BB:CC:DD:EE:FF", status, *version)
                .unwrap());
        }

        let row = k.get_device("AA:BB:CC:DD:EE:FF").unwrap().unwrap();
        assert_eq!(row.status, "success");
        assert_eq!(row.current_version.as_deref(), Some("1.1.0"));
    }

    #[test]
    fn status_without_version_keeps_stored_version() {
        let (_dir, k) = kernel();
        k.upsert_device("dev-1", None, Some("1.0.0"), &DeviceStatus::Connected)
            .unwrap();
        k.update_device_status("dev-1", &DeviceStatus::parse("failed:hash"), None)
            .unwrap();
        let row = k.get_device("dev-1").unwrap().unwrap();
        assert_eq!(row.status, "failed:hash");
        assert!(row.status().is_failure());
        assert_eq!(row.current_version.as_deref(), Some("1.0.0"));
    }

    #[test]
    fn status_update_for_unknown_device_reports_false() {
        let (_dir, k) = kernel();
        assert!(!k
            .update_device_status("ghost", &DeviceStatus::Disconnected, None)
            .unwrap());
    }

    #[test]
    fn duplicate_firmware_is_rejected_without_a_new_row() {
        let (_dir, k) = kernel();
        k.insert_firmware("a.bin", "2.0", "aaaa", 4).unwrap();
        let err = k.insert_firmware("a.bin", "2.0", "bbbb", 8).unwrap_err();
        assert!(matches!(err, CatalogError::Duplicate));
        assert_eq!(k.list_firmwares().unwrap().len(), 1);
        // Same file name under a different version is fine.
        k.insert_firmware("a.bin", "2.1", "bbbb", 8).unwrap();
    }

    #[test]
    fn latest_is_insertion_order_not_version_order() {
        let (_dir, k) = kernel();
        k.insert_firmware("a.bin", "2.0.0", "aaaa", 4).unwrap();
        k.insert_firmware("b.bin", "1.0.0", "bbbb", 4).unwrap();
        let latest = k.latest_firmware().unwrap().unwrap();
        assert_eq!(latest.version, "1.0.0");
        assert_eq!(latest.file_name, "b.bin");
    }

    #[test]
    fn delete_reports_remaining_hash_references() {
        let (_dir, k) = kernel();
        let a = k.insert_firmware("a.bin", "1.0", "same", 4).unwrap();
        let b = k.insert_firmware("b.bin", "1.0", "same", 4).unwrap();
        let (_, remaining) = k.delete_firmware(a.id).unwrap().unwrap();
        assert_eq!(remaining, 1);
        let (_, remaining) = k.delete_firmware(b.id).unwrap().unwrap();
        assert_eq!(remaining, 0);
        assert!(k.delete_firmware(b.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn blob_round_trip_and_remove() {
        let (_dir, k) = kernel();
        let sha = k.blob_put(b"firmware-bytes").await.unwrap();
        assert_eq!(sha.len(), 64);
        assert_eq!(k.blob_read(&sha).await.unwrap(), b"firmware-bytes");
        k.blob_remove(&sha).await.unwrap();
        assert!(k.blob_read(&sha).await.is_err());
        // Removing twice is fine.
        k.blob_remove(&sha).await.unwrap();
    }

    #[test]
    fn clear_firmwares_returns_removed_rows() {
        let (_dir, k) = kernel();
        k.insert_firmware("a.bin", "1.0", "aaaa", 4).unwrap();
        k.insert_firmware("b.bin", "1.0", "bbbb", 4).unwrap();
        let removed = k.clear_firmwares().unwrap();
        assert_eq!(removed.len(), 2);
        assert!(k.latest_firmware().unwrap().is_none());
    }
}
