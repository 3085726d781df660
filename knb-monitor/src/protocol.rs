//! Wire types shared by the agent and the controller's collection client.
//!
//! - `POST /collections` with [`StartCollection`]: 202, or 409 `already_in_progress`
//! - `GET /collections/{id}/results`: archive bytes, or 409 `still_in_progress`,
//!   500 `collection_failed`, 404 `unknown_id`
//! - `GET /sysinfo`: node report bytes

use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8451;

pub const COLLECTIONS_PATH: &str = "/collections";
pub const SYSINFO_PATH: &str = "/sysinfo";
pub const HEALTH_PATH: &str = "/health";

pub fn results_path(collection_id: &str) -> String {
    format!("{COLLECTIONS_PATH}/{collection_id}/results")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartCollection {
    pub collection_id: String,
    /// How long the node should record.
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AlreadyInProgress,
    StillInProgress,
    CollectionFailed,
    UnknownId,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_snake_case() {
        let body = ErrorBody {
            code: ErrorCode::StillInProgress,
            message: "collection r1 still running".into(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["code"], "still_in_progress");
        let back: ErrorBody = serde_json::from_value(json).unwrap();
        assert_eq!(back, body);
    }
}
