use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rusqlite::{Connection, params};
use rusqlite_migration::{M, Migrations};

use super::{
    FeedIndexStore, FeedIndices, PersistedPermissions, PersistedRelayList, RelayStore,
    StorageError, StoreScope,
};

const DEFAULT_DB_FILENAME: &str = "relays.sql";
const FEED_INDICES_KEY: &str = "feed_indices";

/// SQLite-based storage implementation
pub struct SqliteStorage {
    db_dir: PathBuf,
}

impl SqliteStorage {
    /// Creates a new `SQLite` storage
    ///
    /// # Arguments
    ///
    /// * `path` - Directory holding the `SQLite` database file
    ///
    /// # Returns
    ///
    /// A new `SqliteStorage` instance or an error
    pub fn new(path: &Path) -> Result<Self, StorageError> {
        let storage = Self {
            db_dir: path.to_path_buf(),
        };

        std::fs::create_dir_all(path)
            .map_err(|e| StorageError::InitializationError(e.to_string()))?;

        storage.migrate()?;
        Ok(storage)
    }

    pub(crate) fn get_connection(&self) -> Result<Connection, StorageError> {
        Ok(Connection::open(self.get_db_path())?)
    }

    fn get_db_path(&self) -> PathBuf {
        self.db_dir.join(DEFAULT_DB_FILENAME)
    }

    fn migrate(&self) -> Result<(), StorageError> {
        let migrations =
            Migrations::new(Self::current_migrations().into_iter().map(M::up).collect());
        let mut conn = self.get_connection()?;
        migrations.to_latest(&mut conn)?;
        Ok(())
    }

    pub(crate) fn current_migrations() -> Vec<&'static str> {
        vec![
            "CREATE TABLE IF NOT EXISTS relay_lists (
              scope TEXT PRIMARY KEY,
              relays TEXT NOT NULL,
              permissions TEXT NOT NULL
            );",
            "CREATE TABLE IF NOT EXISTS settings (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );",
        ]
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(value: rusqlite::Error) -> Self {
        StorageError::Implementation(value.to_string())
    }
}

impl From<rusqlite_migration::Error> for StorageError {
    fn from(value: rusqlite_migration::Error) -> Self {
        StorageError::Implementation(value.to_string())
    }
}

#[async_trait]
impl RelayStore for SqliteStorage {
    async fn get_relay_list(
        &self,
        scope: StoreScope,
    ) -> Result<Option<PersistedRelayList>, StorageError> {
        let connection = self.get_connection()?;

        let mut stmt =
            connection.prepare("SELECT relays, permissions FROM relay_lists WHERE scope = ?")?;

        let result = stmt.query_row(params![scope.key()], |row| {
            let relays: String = row.get(0)?;
            let permissions: String = row.get(1)?;
            Ok((relays, permissions))
        });

        let (relays, permissions) = match result {
            Ok(row) => row,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let relays: Vec<String> = serde_json::from_str(&relays)?;
        let permissions: PersistedPermissions = serde_json::from_str(&permissions)?;
        Ok(Some(PersistedRelayList {
            relays,
            permissions,
        }))
    }

    async fn set_relay_list(
        &self,
        scope: StoreScope,
        list: PersistedRelayList,
    ) -> Result<(), StorageError> {
        let connection = self.get_connection()?;

        connection.execute(
            "INSERT OR REPLACE INTO relay_lists (scope, relays, permissions) VALUES (?, ?, ?)",
            params![
                scope.key(),
                serde_json::to_string(&list.relays)?,
                serde_json::to_string(&list.permissions)?
            ],
        )?;

        Ok(())
    }

    async fn delete_relay_list(&self, scope: StoreScope) -> Result<(), StorageError> {
        let connection = self.get_connection()?;

        connection.execute(
            "DELETE FROM relay_lists WHERE scope = ?",
            params![scope.key()],
        )?;

        Ok(())
    }
}

#[async_trait]
impl FeedIndexStore for SqliteStorage {
    async fn get_feed_indices(&self) -> Result<Option<FeedIndices>, StorageError> {
        let connection = self.get_connection()?;

        let mut stmt = connection.prepare("SELECT value FROM settings WHERE key = ?")?;

        let result = stmt.query_row(params![FEED_INDICES_KEY], |row| {
            let value_str: String = row.get(0)?;
            Ok(value_str)
        });

        match result {
            Ok(value) => Ok(Some(serde_json::from_str(&value)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_feed_indices(&self, indices: FeedIndices) -> Result<(), StorageError> {
        let connection = self.get_connection()?;

        connection.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?, ?)",
            params![FEED_INDICES_KEY, serde_json::to_string(&indices)?],
        )?;

        Ok(())
    }

    async fn clear_feed_indices(&self) -> Result<(), StorageError> {
        let connection = self.get_connection()?;

        connection.execute(
            "DELETE FROM settings WHERE key = ?",
            params![FEED_INDICES_KEY],
        )?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use nostr::Keys;
    use rusqlite::params;

    use super::SqliteStorage;
    use crate::{
        models::RelayPermission,
        persist::{RelayStore, StorageError, StoreScope},
        url::RelayUrl,
    };

    #[tokio::test]
    async fn test_relay_store() {
        let temp_dir = tempdir::TempDir::new("sqlite_storage").unwrap();
        let storage = SqliteStorage::new(temp_dir.path()).unwrap();

        crate::persist::tests::test_relay_store(Box::new(storage)).await;
    }

    #[tokio::test]
    async fn test_feed_index_store() {
        let temp_dir = tempdir::TempDir::new("sqlite_storage_feed").unwrap();
        let storage = SqliteStorage::new(temp_dir.path()).unwrap();

        crate::persist::tests::test_feed_index_store(Box::new(storage)).await;
    }

    #[tokio::test]
    async fn test_reopen_keeps_data() {
        let temp_dir = tempdir::TempDir::new("sqlite_storage_reopen").unwrap();
        let identity = Keys::generate().public_key();
        {
            let storage = SqliteStorage::new(temp_dir.path()).unwrap();
            crate::persist::tests::seed(&storage, StoreScope::Identity(identity)).await;
        }

        let storage = SqliteStorage::new(temp_dir.path()).unwrap();
        let list = storage
            .get_relay_list(StoreScope::Identity(identity))
            .await
            .unwrap()
            .unwrap()
            .into_relay_list();
        assert_eq!(list.len(), 2);
    }

    #[tokio::test]
    async fn test_legacy_permissions_row_is_readable() {
        let temp_dir = tempdir::TempDir::new("sqlite_storage_legacy").unwrap();
        let storage = SqliteStorage::new(temp_dir.path()).unwrap();

        storage
            .get_connection()
            .unwrap()
            .execute(
                "INSERT INTO relay_lists (scope, relays, permissions) VALUES (?, ?, ?)",
                params![
                    "global",
                    r#"["wss://a.relay","wss://b.relay"]"#,
                    r#"["wss://a.relay"]"#
                ],
            )
            .unwrap();

        let list = storage
            .get_relay_list(StoreScope::Global)
            .await
            .unwrap()
            .unwrap()
            .into_relay_list();
        assert_eq!(
            list.permission(&RelayUrl::parse("a.relay").unwrap()),
            Some(RelayPermission::Write)
        );
        assert_eq!(
            list.permission(&RelayUrl::parse("b.relay").unwrap()),
            Some(RelayPermission::Read)
        );
    }

    #[tokio::test]
    async fn test_malformed_row_is_a_serialization_error() {
        let temp_dir = tempdir::TempDir::new("sqlite_storage_malformed").unwrap();
        let storage = SqliteStorage::new(temp_dir.path()).unwrap();

        storage
            .get_connection()
            .unwrap()
            .execute(
                "INSERT INTO relay_lists (scope, relays, permissions) VALUES (?, ?, ?)",
                params!["global", "not json", "{}"],
            )
            .unwrap();

        let result = storage.get_relay_list(StoreScope::Global).await;
        assert!(matches!(result, Err(StorageError::Serialization(_))));
    }
}
