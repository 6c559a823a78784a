//! Operation types for the sync queue.
//!
//! Defines the kinds of offline work that can be queued, their typed payloads,
//! and the stored [`Operation`] record.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::RollsyncError;

/// Default attempt budget for a queued operation.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Operation types that can be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Biometric enrollment of a person
    Registration,
    /// Identity-verification outcome
    Verification,
    /// Edit to an existing record
    RecordUpdate,
}

impl OperationType {
    /// All operation types, in upload order.
    pub const ALL: [Self; 3] = [Self::Registration, Self::Verification, Self::RecordUpdate];

    /// Get the display name for this operation type.
    #[must_use]
    pub const fn display_name(&self) -> &'static str {
        match self {
            Self::Registration => "Registration",
            Self::Verification => "Verification",
            Self::RecordUpdate => "Record Update",
        }
    }

    /// Storage and wire identifier.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Registration => "registration",
            Self::Verification => "verification",
            Self::RecordUpdate => "record_update",
        }
    }

    /// Queue priority for this type (higher = served first).
    #[must_use]
    pub const fn priority(&self) -> i64 {
        match self {
            Self::Registration => 2,
            Self::Verification => 1,
            Self::RecordUpdate => 0,
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl FromStr for OperationType {
    type Err = RollsyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "registration" | "register" => Ok(Self::Registration),
            "verification" | "verify" => Ok(Self::Verification),
            "record_update" | "update" => Ok(Self::RecordUpdate),
            other => Err(RollsyncError::InvalidPayload(format!(
                "Unknown operation type: {other}"
            ))),
        }
    }
}

/// Status of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting to be uploaded
    Pending,
    /// Claimed by a batch and in flight
    Syncing,
    /// Accepted by the server
    Synced,
    /// Out of attempts
    Failed,
    /// Withdrawn before upload
    Cancelled,
}

impl OperationStatus {
    /// Check if this status is terminal (no automatic action will follow).
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Synced | Self::Failed | Self::Cancelled)
    }

    /// Storage identifier.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = RollsyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "syncing" => Ok(Self::Syncing),
            "synced" => Ok(Self::Synced),
            "failed" => Ok(Self::Failed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(RollsyncError::InvalidPayload(format!(
                "Unknown operation status: {other}"
            ))),
        }
    }
}

/// A typed payload that can be queued.
pub trait OperationPayload: Serialize + DeserializeOwned {
    /// Operation type this payload belongs to.
    const KIND: OperationType;

    /// Caller-meaningful identifier used to match server outcomes.
    fn natural_key(&self) -> &str;
}

/// Payload for a biometric enrollment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationPayload {
    pub roll_number: String,
    pub full_name: String,
    pub organization_id: String,
    /// Base64-encoded fingerprint template.
    pub template: String,
    #[serde(default)]
    pub quality: Option<u8>,
    pub captured_at: DateTime<Utc>,
}

impl OperationPayload for RegistrationPayload {
    const KIND: OperationType = OperationType::Registration;

    fn natural_key(&self) -> &str {
        &self.roll_number
    }
}

/// Payload for an identity-verification outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationPayload {
    pub roll_number: String,
    pub matched: bool,
    #[serde(default)]
    pub score: Option<f32>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub verified_at: DateTime<Utc>,
}

impl OperationPayload for VerificationPayload {
    const KIND: OperationType = OperationType::Verification;

    fn natural_key(&self) -> &str {
        &self.roll_number
    }
}

/// Payload for an edit to an existing record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordUpdatePayload {
    pub roll_number: String,
    /// Changed fields, as a JSON object.
    pub changes: serde_json::Map<String, serde_json::Value>,
    pub edited_at: DateTime<Utc>,
}

impl OperationPayload for RecordUpdatePayload {
    const KIND: OperationType = OperationType::RecordUpdate;

    fn natural_key(&self) -> &str {
        &self.roll_number
    }
}

#[derive(Deserialize)]
struct NaturalKey {
    roll_number: String,
}

/// Extract the natural key from a stored JSON payload.
///
/// # Errors
///
/// Returns `RollsyncError::InvalidPayload` if the payload is not JSON or has
/// no non-empty `roll_number`.
pub fn natural_key_of(payload: &str) -> Result<String, RollsyncError> {
    let key: NaturalKey = serde_json::from_str(payload)
        .map_err(|e| RollsyncError::InvalidPayload(format!("Unreadable payload: {e}")))?;
    let roll = key.roll_number.trim();
    if roll.is_empty() {
        return Err(RollsyncError::InvalidPayload(
            "Payload has an empty roll_number".to_string(),
        ));
    }
    Ok(roll.to_string())
}

/// A queued operation as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    /// Store-assigned id, never reused
    pub id: i64,
    /// Operation type
    pub operation_type: OperationType,
    /// JSON payload
    pub payload: String,
    /// Higher is served first
    pub priority: i64,
    /// When the operation was queued
    pub created_at: DateTime<Utc>,
    /// Not eligible before this instant
    pub scheduled_at: DateTime<Utc>,
    /// Failed upload attempts so far
    pub attempts: u32,
    /// Attempt budget
    pub max_attempts: u32,
    /// Current status
    pub status: OperationStatus,
    /// Last error message
    pub last_error: Option<String>,
    /// Set on terminal success
    pub synced_at: Option<DateTime<Utc>>,
    /// When the current batch claimed it
    pub claimed_at: Option<DateTime<Utc>>,
    /// When an upload outcome was last applied
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl Operation {
    /// Natural key embedded in the payload.
    ///
    /// # Errors
    ///
    /// Returns `RollsyncError::InvalidPayload` for corrupted payloads.
    pub fn natural_key(&self) -> Result<String, RollsyncError> {
        natural_key_of(&self.payload)
    }

    /// Payload as a JSON value, for embedding in an upload request.
    ///
    /// # Errors
    ///
    /// Returns `RollsyncError::InvalidPayload` for corrupted payloads.
    pub fn payload_value(&self) -> Result<serde_json::Value, RollsyncError> {
        serde_json::from_str(&self.payload)
            .map_err(|e| RollsyncError::InvalidPayload(format!("Unreadable payload: {e}")))
    }

    /// Decode the payload into its typed form.
    ///
    /// # Errors
    ///
    /// Returns `RollsyncError::InvalidPayload` if the payload belongs to a
    /// different operation type or does not decode.
    pub fn decode<P: OperationPayload>(&self) -> Result<P, RollsyncError> {
        if self.operation_type != P::KIND {
            return Err(RollsyncError::InvalidPayload(format!(
                "Expected a {} payload, found {}",
                P::KIND,
                self.operation_type
            )));
        }
        serde_json::from_str(&self.payload)
            .map_err(|e| RollsyncError::InvalidPayload(format!("Unreadable payload: {e}")))
    }

    /// Check that the payload decodes into the typed form for its operation
    /// type and carries a natural key, returning that key.
    ///
    /// # Errors
    ///
    /// Returns `RollsyncError::InvalidPayload` if either check fails.
    pub fn checked_natural_key(&self) -> Result<String, RollsyncError> {
        match self.operation_type {
            OperationType::Registration => self.decode::<RegistrationPayload>().map(drop)?,
            OperationType::Verification => self.decode::<VerificationPayload>().map(drop)?,
            OperationType::RecordUpdate => self.decode::<RecordUpdatePayload>().map(drop)?,
        }
        self.natural_key()
    }

    /// Failed item that still has attempts left (only after an administrative
    /// reset or a lowered attempt budget).
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.status, OperationStatus::Failed) && self.attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap()
    }

    fn stored(operation_type: OperationType, payload: &str) -> Operation {
        Operation {
            id: 1,
            operation_type,
            payload: payload.to_string(),
            priority: operation_type.priority(),
            created_at: sample_time(),
            scheduled_at: sample_time(),
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            status: OperationStatus::Pending,
            last_error: None,
            synced_at: None,
            claimed_at: None,
            last_attempt_at: None,
        }
    }

    #[test]
    fn test_operation_type_priority() {
        assert_eq!(OperationType::Registration.priority(), 2);
        assert_eq!(OperationType::Verification.priority(), 1);
        assert_eq!(OperationType::RecordUpdate.priority(), 0);
    }

    #[test]
    fn test_operation_type_parse() {
        assert_eq!(
            "record-update".parse::<OperationType>().unwrap(),
            OperationType::RecordUpdate
        );
        assert_eq!(
            "verify".parse::<OperationType>().unwrap(),
            OperationType::Verification
        );
        assert!("delete".parse::<OperationType>().is_err());
    }

    #[test]
    fn test_operation_status_terminal() {
        assert!(OperationStatus::Synced.is_terminal());
        assert!(OperationStatus::Failed.is_terminal());
        assert!(OperationStatus::Cancelled.is_terminal());
        assert!(!OperationStatus::Pending.is_terminal());
        assert!(!OperationStatus::Syncing.is_terminal());
    }

    #[test]
    fn test_natural_key_from_payload() {
        let payload = VerificationPayload {
            roll_number: "CS-2024-017".to_string(),
            matched: true,
            score: Some(0.93),
            session_id: None,
            verified_at: sample_time(),
        };
        let json = serde_json::to_string(&payload).unwrap();

        assert_eq!(natural_key_of(&json).unwrap(), "CS-2024-017");
    }

    #[test]
    fn test_natural_key_rejects_corrupt_payloads() {
        assert!(matches!(
            natural_key_of("not json"),
            Err(RollsyncError::InvalidPayload(_))
        ));
        assert!(matches!(
            natural_key_of(r#"{"roll_number": "  "}"#),
            Err(RollsyncError::InvalidPayload(_))
        ));
        assert!(matches!(
            natural_key_of(r#"{"name": "no key"}"#),
            Err(RollsyncError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_decode_checks_kind() {
        let payload = RegistrationPayload {
            roll_number: "R-1".to_string(),
            full_name: "Ada Obi".to_string(),
            organization_id: "ORG-7".to_string(),
            template: "AAEC".to_string(),
            quality: Some(80),
            captured_at: sample_time(),
        };
        let op = stored(
            OperationType::Registration,
            &serde_json::to_string(&payload).unwrap(),
        );

        let decoded: RegistrationPayload = op.decode().unwrap();
        assert_eq!(decoded, payload);
        assert!(op.decode::<VerificationPayload>().is_err());
    }

    #[test]
    fn test_is_retryable() {
        let mut op = stored(OperationType::Verification, r#"{"roll_number":"R-2"}"#);
        op.status = OperationStatus::Failed;
        op.attempts = 3;
        assert!(!op.is_retryable());

        op.attempts = 0;
        assert!(op.is_retryable());
    }
}
