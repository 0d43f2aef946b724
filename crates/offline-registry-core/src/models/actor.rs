//! Actors creating records on the device.

use serde::{Deserialize, Serialize};

/// Role of the health worker operating the device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ActorRole {
    /// Primary health centre staff
    Phc,
    /// Accredited social health activist
    Asha,
    /// Auxiliary nurse midwife
    Anm,
    Doctor,
    Admin,
}

impl ActorRole {
    /// Short tag embedded in temporary IDs.
    pub fn tag(&self) -> &'static str {
        match self {
            ActorRole::Phc => "PHC",
            ActorRole::Asha => "ASHA",
            ActorRole::Anm => "ANM",
            ActorRole::Doctor => "DOC",
            ActorRole::Admin => "ADM",
        }
    }

    /// Parse a role from its tag or name (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "phc" => Some(ActorRole::Phc),
            "asha" => Some(ActorRole::Asha),
            "anm" => Some(ActorRole::Anm),
            "doc" | "doctor" => Some(ActorRole::Doctor),
            "adm" | "admin" => Some(ActorRole::Admin),
            _ => None,
        }
    }
}

/// The user on whose behalf an operation runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub role: ActorRole,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: ActorRole) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    /// Actor used for transitions driven by the background processor.
    pub fn system() -> Self {
        Self::new("system", ActorRole::Admin)
    }
}
