use jobrunr_sql::{BindFields, DatabaseValue, Row, RowError, SqlEngine};

use super::METADATA_TABLE;
use crate::StorageError;
use crate::models::{JobRunrMetadata, metadata_id};

impl BindFields for JobRunrMetadata {
    fn bind_field(&self, name: &str) -> Option<DatabaseValue> {
        Some(match name {
            "id" => self.id().into(),
            "name" => self.name.as_str().into(),
            "owner" => self.owner.as_str().into(),
            "value" => self.value.as_str().into(),
            "createdAt" => self.created_at.into(),
            "updatedAt" => self.updated_at.into(),
            _ => return None,
        })
    }
}

fn to_metadata(row: &Row) -> Result<JobRunrMetadata, RowError> {
    Ok(JobRunrMetadata {
        name: row.as_string("name")?,
        owner: row.as_string("owner")?,
        value: row.as_string("value")?,
        created_at: row.as_instant("createdAt")?,
        updated_at: row.as_instant("updatedAt")?,
    })
}

#[derive(Debug, Clone, Copy)]
pub struct MetadataTable<'a> {
    engine: &'a SqlEngine,
}

impl<'a> MetadataTable<'a> {
    #[must_use]
    pub const fn new(engine: &'a SqlEngine) -> Self {
        Self { engine }
    }

    /// Updates the value of an existing record, inserts it otherwise.
    ///
    /// # Errors
    ///
    /// * If the write fails
    pub fn save(self, metadata: &JobRunrMetadata) -> Result<(), StorageError> {
        let sql = self
            .engine
            .sql::<JobRunrMetadata>(METADATA_TABLE)
            .with("id", metadata.id());

        if sql.select_exists("from jobrunr_metadata where id = :id")? {
            sql.update(
                metadata,
                "jobrunr_metadata set value = :value, updatedAt = :updatedAt where id = :id",
            )?;
        } else {
            sql.insert(
                metadata,
                "into jobrunr_metadata (id, name, owner, value, createdAt, updatedAt) values (:id, :name, :owner, :value, :createdAt, :updatedAt)",
            )?;
        }

        Ok(())
    }

    /// # Errors
    ///
    /// * If the query fails or a row is malformed
    pub fn get_all(self, name: &str) -> Result<Vec<JobRunrMetadata>, StorageError> {
        Ok(self
            .engine
            .sql::<()>(METADATA_TABLE)
            .with("name", name)
            .select_map("* from jobrunr_metadata where name = :name", to_metadata)?)
    }

    /// # Errors
    ///
    /// * [`StorageError::MetadataNotFound`] if no such record exists
    pub fn get(self, name: &str, owner: &str) -> Result<JobRunrMetadata, StorageError> {
        self.engine
            .sql::<()>(METADATA_TABLE)
            .with("id", metadata_id(name, owner))
            .select_first("* from jobrunr_metadata where id = :id", to_metadata)?
            .ok_or_else(|| StorageError::MetadataNotFound {
                name: name.to_string(),
                owner: owner.to_string(),
            })
    }

    /// Deletes every record of `name`.
    ///
    /// # Errors
    ///
    /// * If the delete fails
    pub fn delete_by_key(self, name: &str) -> Result<u64, StorageError> {
        Ok(self
            .engine
            .sql::<()>(METADATA_TABLE)
            .with("name", name)
            .delete("from jobrunr_metadata where name = :name")?)
    }
}
