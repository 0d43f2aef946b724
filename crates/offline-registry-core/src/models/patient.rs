//! Patient models.

use serde::{Deserialize, Serialize};

use super::{Actor, SyncStatus};

/// Domain fields captured by the field worker.
///
/// This is the value that gets snapshotted into a sync queue item, so it
/// must stay a plain value type with no references into the cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PatientFields {
    /// Patient full name
    pub name: String,
    /// Father/husband/guardian name (used for household duplicate matching)
    pub guardian_name: Option<String>,
    /// Mobile number
    pub phone: String,
    /// Age in years
    pub age: Option<u32>,
    /// Gender ("Male", "Female", "Other")
    pub gender: Option<String>,
    /// Working diagnosis
    pub diagnosis: Option<String>,
    /// Primary health centre the patient is registered at
    pub phc: String,
    /// Village / locality
    pub village: Option<String>,
    /// Systolic blood pressure (mmHg)
    pub systolic_bp: Option<u32>,
    /// Diastolic blood pressure (mmHg)
    pub diastolic_bp: Option<u32>,
    /// Free-text notes
    pub notes: Option<String>,
}

/// A value looked up by field name, used by the rule engine.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue<'a> {
    Text(&'a str),
    Number(f64),
    Missing,
}

impl PatientFields {
    /// Create fields with the minimum identifying data.
    pub fn new(name: impl Into<String>, phone: impl Into<String>, phc: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phone: phone.into(),
            phc: phc.into(),
            ..Default::default()
        }
    }

    /// Look up a field by its wire name.
    pub fn value_of(&self, field: &str) -> FieldValue<'_> {
        fn text(s: &str) -> FieldValue<'_> {
            if s.trim().is_empty() {
                FieldValue::Missing
            } else {
                FieldValue::Text(s)
            }
        }
        fn opt_text(s: &Option<String>) -> FieldValue<'_> {
            s.as_deref().map(text).unwrap_or(FieldValue::Missing)
        }
        fn opt_num(n: Option<u32>) -> FieldValue<'static> {
            n.map(|v| FieldValue::Number(v as f64))
                .unwrap_or(FieldValue::Missing)
        }

        match field {
            "name" => text(&self.name),
            "guardian_name" => opt_text(&self.guardian_name),
            "phone" => text(&self.phone),
            "age" => opt_num(self.age),
            "gender" => opt_text(&self.gender),
            "diagnosis" => opt_text(&self.diagnosis),
            "phc" => text(&self.phc),
            "village" => opt_text(&self.village),
            "systolic_bp" => opt_num(self.systolic_bp),
            "diastolic_bp" => opt_num(self.diastolic_bp),
            "notes" => opt_text(&self.notes),
            _ => FieldValue::Missing,
        }
    }

    /// Keys used for duplicate detection, locally and on the server.
    pub fn match_keys(&self) -> MatchKeys {
        MatchKeys {
            phone: self.phone.trim().to_string(),
            name: self.name.trim().to_string(),
            guardian_name: self
                .guardian_name
                .as_deref()
                .map(str::trim)
                .filter(|g| !g.is_empty())
                .map(str::to_string),
        }
    }

    /// Apply user edits over these fields, returning a new snapshot.
    pub fn with_edits(&self, edits: &PatientEdits) -> Self {
        let mut next = self.clone();
        if let Some(name) = &edits.name {
            next.name = name.clone();
        }
        if let Some(guardian) = &edits.guardian_name {
            next.guardian_name = Some(guardian.clone());
        }
        if let Some(phone) = &edits.phone {
            next.phone = phone.clone();
        }
        if let Some(age) = edits.age {
            next.age = Some(age);
        }
        if let Some(gender) = &edits.gender {
            next.gender = Some(gender.clone());
        }
        if let Some(diagnosis) = &edits.diagnosis {
            next.diagnosis = Some(diagnosis.clone());
        }
        if let Some(phc) = &edits.phc {
            next.phc = phc.clone();
        }
        if let Some(village) = &edits.village {
            next.village = Some(village.clone());
        }
        if let Some(systolic) = edits.systolic_bp {
            next.systolic_bp = Some(systolic);
        }
        if let Some(diastolic) = edits.diastolic_bp {
            next.diastolic_bp = Some(diastolic);
        }
        if let Some(notes) = &edits.notes {
            next.notes = Some(notes.clone());
        }
        next
    }
}

/// Partial update applied when the operator retries a failed record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PatientEdits {
    pub name: Option<String>,
    pub guardian_name: Option<String>,
    pub phone: Option<String>,
    pub age: Option<u32>,
    pub gender: Option<String>,
    pub diagnosis: Option<String>,
    pub phc: Option<String>,
    pub village: Option<String>,
    pub systolic_bp: Option<u32>,
    pub diastolic_bp: Option<u32>,
    pub notes: Option<String>,
}

impl PatientEdits {
    /// True when no field would change.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Duplicate-detection keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MatchKeys {
    pub phone: String,
    pub name: String,
    pub guardian_name: Option<String>,
}

/// Sync bookkeeping stored alongside each cached record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncMetadata {
    /// Number of remote attempts made
    pub attempts: u32,
    /// Time of the last remote attempt (RFC 3339)
    pub last_attempt_at: Option<String>,
    /// Last error shown to the operator
    pub last_error: Option<String>,
    /// Who created the record
    pub created_by: Actor,
    /// Attempt budget before the record is marked failed
    pub max_attempts: u32,
}

/// A patient record in the local entity cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatientRecord {
    /// Current key: temporary ID until reconciled, then the server ID
    pub id: String,
    /// Temporary ID retained as a historical alias after reconciliation
    pub temporary_alias: Option<String>,
    /// Domain fields
    pub fields: PatientFields,
    /// Lifecycle status
    pub status: SyncStatus,
    /// Sync bookkeeping
    pub sync: SyncMetadata,
    /// Creation timestamp
    pub created_at: String,
    /// Last update timestamp
    pub updated_at: String,
}

impl PatientRecord {
    /// Create a new pending record under a temporary ID.
    pub fn new_pending(
        temporary_id: String,
        fields: PatientFields,
        actor: Actor,
        max_attempts: u32,
    ) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: temporary_id,
            temporary_alias: None,
            fields,
            status: SyncStatus::Pending,
            sync: SyncMetadata {
                attempts: 0,
                last_attempt_at: None,
                last_error: None,
                created_by: actor,
                max_attempts,
            },
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Check if this record has been confirmed by the server.
    pub fn is_synced(&self) -> bool {
        self.status == SyncStatus::Synced
    }

    /// The temporary ID this record was created under, if any.
    pub fn temporary_id(&self) -> Option<&str> {
        match &self.temporary_alias {
            Some(alias) => Some(alias),
            None if self.status != SyncStatus::Synced => Some(&self.id),
            None => None,
        }
    }

    /// True if `id` names this record, directly or through its alias.
    pub fn answers_to(&self, id: &str) -> bool {
        self.id == id || self.temporary_alias.as_deref() == Some(id)
    }

    /// Touch the updated_at timestamp.
    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().to_rfc3339();
    }
}
