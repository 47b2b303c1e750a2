//! Admin driver for the shared database cluster.
//!
//! Thin wrapper over the MongoDB command protocol: user and database
//! lifecycle plus per-collection index assertion. A connection is opened per
//! reconcile tick and dropped on return; nothing is cached across ticks.

use mongodb::bson::{doc, Document};
use mongodb::options::IndexOptions;
use mongodb::{Client as DbClient, IndexModel};
use tracing::{debug, info};

use crate::error::{OperatorError, Result};
use crate::services::CollectionSpec;

/// Server error code for a missing user during `dropUser`.
pub const CODE_USER_NOT_FOUND: i32 = 11;
/// Server error code for a missing database during drop.
pub const CODE_NAMESPACE_NOT_FOUND: i32 = 26;

/// Extract the server error code from a driver error, when there is one.
pub fn server_error_code(err: &mongodb::error::Error) -> Option<i32> {
    match err.kind.as_ref() {
        mongodb::error::ErrorKind::Command(command_error) => Some(command_error.code),
        _ => None,
    }
}

/// Whether an error from a teardown operation is the expected not-found case.
pub fn is_benign_cleanup_code(code: Option<i32>, benign: i32) -> bool {
    code == Some(benign)
}

pub struct DatabaseAdmin {
    client: DbClient,
}

impl DatabaseAdmin {
    /// Connect with admin credentials and verify the server responds.
    pub async fn connect(uri: &str) -> Result<Self> {
        let client = DbClient::with_uri_str(uri).await?;
        client.database("admin").run_command(doc! {"ping": 1}).await?;
        Ok(Self { client })
    }

    /// Drop a user, treating user-not-found as success.
    pub async fn drop_user(&self, user: &str) -> Result<()> {
        let admin = self.client.database("admin");
        match admin.run_command(doc! {"dropUser": user}).await {
            Ok(_) => {
                info!(user = %user, "Dropped database user");
                Ok(())
            }
            Err(e) if is_benign_cleanup_code(server_error_code(&e), CODE_USER_NOT_FOUND) => {
                debug!(user = %user, "User not found during drop");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Create a user granted `readWrite` on each of the given databases.
    pub async fn create_user(&self, user: &str, password: &str, databases: &[String]) -> Result<()> {
        let roles: Vec<Document> = databases
            .iter()
            .map(|db| doc! {"role": "readWrite", "db": db})
            .collect();

        self.client
            .database("admin")
            .run_command(doc! {
                "createUser": user,
                "pwd": password,
                "roles": roles,
            })
            .await?;

        info!(user = %user, databases = databases.len(), "Created database user");
        Ok(())
    }

    /// Assert the collection and index set for one database. Index creation
    /// is idempotent on the server, so replays converge.
    pub async fn ensure_collections(
        &self,
        db_name: &str,
        collections: &[CollectionSpec],
    ) -> Result<()> {
        let database = self.client.database(db_name);
        for collection in collections {
            let handle = database.collection::<Document>(collection.name);
            for index in collection.indexes {
                let options = IndexOptions::builder().unique(index.unique).build();
                let model = IndexModel::builder()
                    .keys(doc! {index.key: 1})
                    .options(options)
                    .build();
                handle.create_index(model).await?;
            }
        }
        debug!(database = %db_name, collections = collections.len(), "Asserted indexes");
        Ok(())
    }

    /// Drop a database, treating namespace-not-found as success.
    pub async fn drop_database(&self, db_name: &str) -> Result<()> {
        match self.client.database(db_name).drop().await {
            Ok(()) => {
                info!(database = %db_name, "Dropped database");
                Ok(())
            }
            Err(e) if is_benign_cleanup_code(server_error_code(&e), CODE_NAMESPACE_NOT_FOUND) => {
                debug!(database = %db_name, "Database not found during drop");
                Ok(())
            }
            Err(e) => Err(OperatorError::Database(format!(
                "failed to drop {}: {}",
                db_name, e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_benign_code_classification() {
        assert!(is_benign_cleanup_code(Some(11), CODE_USER_NOT_FOUND));
        assert!(is_benign_cleanup_code(Some(26), CODE_NAMESPACE_NOT_FOUND));
        // Any other server error is a real failure
        assert!(!is_benign_cleanup_code(Some(13), CODE_USER_NOT_FOUND));
        // Network errors have no server code and are never benign
        assert!(!is_benign_cleanup_code(None, CODE_NAMESPACE_NOT_FOUND));
    }
}
