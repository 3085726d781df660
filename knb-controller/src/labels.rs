//! Label keys tying cluster resources to sessions and runs.

use std::fmt;

use thiserror::Error;

pub const SESSION_LABEL: &str = "knb-sessid";
pub const RUN_LABEL: &str = "knb-runid";
pub const ROLE_LABEL: &str = "role";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Server,
    Client,
    Monitor,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Server => "srv",
            Role::Client => "cli",
            Role::Monitor => "monitor",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `key: "value"`, for manifest bodies. Quoted so numeric ids stay strings.
pub fn yaml_label(key: &str, value: &str) -> String {
    format!("{key}: \"{value}\"")
}

/// `key=value`, for `-l` selectors.
pub fn selector(key: &str, value: &str) -> String {
    format!("{key}={value}")
}

pub fn with_role(base: &str, role: Role) -> String {
    format!("{base},{}", selector(ROLE_LABEL, role.as_str()))
}

const NAME_MAX: usize = 63;

/// Longest accepted run label. The run id appends `-<14-digit stamp>` and
/// possibly `-<n>`, and must stay a valid label value (63 characters).
pub const RUN_LABEL_MAX: usize = 40;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LabelError {
    #[error("run label {label:?} is longer than {max} characters")]
    TooLong { label: String, max: usize },
    #[error("run label {0:?} must start with a letter or digit and contain only letters, digits, '-', '_' or '.'")]
    Invalid(String),
}

pub fn check_run_label(label: &str) -> Result<(), LabelError> {
    if label.chars().count() > RUN_LABEL_MAX {
        return Err(LabelError::TooLong {
            label: label.to_string(),
            max: RUN_LABEL_MAX,
        });
    }
    let valid = label.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(LabelError::Invalid(label.to_string()));
    }
    Ok(())
}

/// `knb-<run>-<suffix>`, lower-cased and DNS-1123 safe. When too long, the
/// head of the run id is dropped: the stamp and collision suffix at its end
/// are what keep names of concurrent runs apart.
pub fn resource_name(run_id: &str, suffix: &str) -> String {
    let budget = NAME_MAX.saturating_sub("knb-".len() + suffix.len() + 1);
    let sanitized: Vec<char> = run_id
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    let tail = &sanitized[sanitized.len().saturating_sub(budget)..];
    let run: String = tail.iter().collect();
    let run = run.trim_matches('-');
    format!("knb-{run}-{suffix}")
}
