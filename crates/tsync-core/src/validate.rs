//! Record validation. Findings annotate a record; they never block it.

use serde::{Deserialize, Serialize};

use crate::EnrichedRecord;

pub const KNOWN_STATUSES: [&str; 4] = ["ACTIVE", "INACTIVE", "PENDING", "REVOKED"];

const MAX_TOKEN_ID_LEN: usize = 500;
const MAX_DID_LEN: usize = 1000;
const MIN_DID_LEN: usize = 10;
const MAX_CONTENT_LEN: usize = 50_000;
const MIN_CONTENT_LEN: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validation {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

pub fn validate(record: &EnrichedRecord) -> Validation {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    match record.token_id.text() {
        None | Some("") => errors.push("missing token id".to_string()),
        Some(id) if id.chars().count() > MAX_TOKEN_ID_LEN => errors.push(format!(
            "token id too long ({} > {MAX_TOKEN_ID_LEN})",
            id.chars().count()
        )),
        Some(_) => {}
    }

    if let Some(did) = record.did.text() {
        let len = did.chars().count();
        if len > MAX_DID_LEN {
            errors.push(format!("did too long ({len} > {MAX_DID_LEN})"));
        } else if len < MIN_DID_LEN {
            warnings.push(format!("did unusually short ({len} < {MIN_DID_LEN})"));
        }
    }

    if let Some(status) = record.token_status.text() {
        if !KNOWN_STATUSES.contains(&status) {
            warnings.push(format!("unrecognised token status {status:?}"));
        }
    }

    if record.content_fetched {
        if let Some(content) = &record.content {
            let len = content.chars().count();
            if len > MAX_CONTENT_LEN {
                errors.push(format!("content too large ({len} > {MAX_CONTENT_LEN})"));
            } else if len < MIN_CONTENT_LEN {
                warnings.push(format!("content unusually small ({len} < {MIN_CONTENT_LEN})"));
            }
        }
    }

    if !record.db_path.exists() {
        errors.push(format!("database path does not exist: {}", record.db_path.display()));
    }

    Validation {
        is_valid: errors.is_empty(),
        errors,
        warnings,
    }
}
