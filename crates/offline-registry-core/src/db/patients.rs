//! Entity cache (patient record) database operations.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Database, DbError, DbResult};
use crate::models::{PatientFields, PatientRecord, SyncMetadata, SyncStatus};

const SELECT_PATIENT: &str = r#"
    SELECT id, temporary_alias, status, fields, sync_meta, created_at, updated_at
    FROM entity_cache
"#;

impl Database {
    /// Insert or update a cached patient record.
    pub fn upsert_patient_record(&self, record: &PatientRecord) -> DbResult<()> {
        upsert_patient_record(&self.conn, record)
    }

    /// Get a patient record by its current ID.
    pub fn get_patient_record(&self, id: &str) -> DbResult<Option<PatientRecord>> {
        self.conn
            .query_row(&format!("{SELECT_PATIENT} WHERE id = ?"), [id], read_row)
            .optional()?
            .map(|row| row.try_into())
            .transpose()
    }

    /// Get a reconciled patient record by its former temporary ID.
    pub fn get_patient_record_by_alias(&self, alias: &str) -> DbResult<Option<PatientRecord>> {
        self.conn
            .query_row(
                &format!("{SELECT_PATIENT} WHERE temporary_alias = ?"),
                [alias],
                read_row,
            )
            .optional()?
            .map(|row| row.try_into())
            .transpose()
    }

    /// List all cached patient records, oldest first.
    pub fn list_patient_records(&self) -> DbResult<Vec<PatientRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_PATIENT} ORDER BY created_at, id"))?;
        let rows = stmt.query_map([], read_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.try_into()?);
        }
        Ok(records)
    }

    /// List cached patient records with the given status.
    pub fn list_patient_records_by_status(
        &self,
        status: SyncStatus,
    ) -> DbResult<Vec<PatientRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "{SELECT_PATIENT} WHERE status = ? ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map([status.as_str()], read_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.try_into()?);
        }
        Ok(records)
    }

    /// Delete a cached patient record.
    pub fn delete_patient_record(&self, id: &str) -> DbResult<bool> {
        delete_patient_record(&self.conn, id)
    }
}

pub(crate) fn upsert_patient_record(conn: &Connection, record: &PatientRecord) -> DbResult<()> {
    let fields_json = serde_json::to_string(&record.fields)?;
    let sync_json = serde_json::to_string(&record.sync)?;

    conn.execute(
        r#"
        INSERT INTO entity_cache (
            id, temporary_alias, status, phone, name, guardian_name,
            fields, sync_meta, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(id) DO UPDATE SET
            temporary_alias = excluded.temporary_alias,
            status = excluded.status,
            phone = excluded.phone,
            name = excluded.name,
            guardian_name = excluded.guardian_name,
            fields = excluded.fields,
            sync_meta = excluded.sync_meta,
            updated_at = excluded.updated_at
        "#,
        params![
            record.id,
            record.temporary_alias,
            record.status.as_str(),
            record.fields.phone.trim(),
            record.fields.name.trim(),
            record.fields.guardian_name,
            fields_json,
            sync_json,
            record.created_at,
            record.updated_at,
        ],
    )?;
    Ok(())
}

pub(crate) fn delete_patient_record(conn: &Connection, id: &str) -> DbResult<bool> {
    let rows_affected = conn.execute("DELETE FROM entity_cache WHERE id = ?", [id])?;
    Ok(rows_affected > 0)
}

/// Intermediate row struct for database mapping.
struct PatientRow {
    id: String,
    temporary_alias: Option<String>,
    status: String,
    fields: String,
    sync_meta: String,
    created_at: String,
    updated_at: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<PatientRow> {
    Ok(PatientRow {
        id: row.get(0)?,
        temporary_alias: row.get(1)?,
        status: row.get(2)?,
        fields: row.get(3)?,
        sync_meta: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

impl TryFrom<PatientRow> for PatientRecord {
    type Error = DbError;

    fn try_from(row: PatientRow) -> Result<Self, Self::Error> {
        let fields: PatientFields = serde_json::from_str(&row.fields)?;
        let sync: SyncMetadata = serde_json::from_str(&row.sync_meta)?;
        let status = SyncStatus::parse(&row.status)
            .ok_or_else(|| DbError::Constraint(format!("Unknown sync status: {}", row.status)))?;

        Ok(PatientRecord {
            id: row.id,
            temporary_alias: row.temporary_alias,
            fields,
            status,
            sync,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
