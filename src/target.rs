//! Registered fuzzing targets and their throughput snapshots.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

pub type TargetId = String;

/// A registered fuzzing job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    #[serde(rename = "id")]
    pub unique_id: TargetId,
    pub language: String,
    pub location: String,
    pub revision: String,
}

impl Target {
    pub fn id(&self) -> &str {
        &self.unique_id
    }
}

/// Normalized throughput/bug-count snapshot for one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetStats {
    pub id: TargetId,
    pub tests_per_second: f64,
    pub bugs_found: u64,
}

impl TargetStats {
    pub fn empty(id: &str) -> Self {
        Self {
            id: id.to_string(),
            tests_per_second: 0.0,
            bugs_found: 0,
        }
    }
}

/// Source languages a target may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    C,
    Cpp,
    Go,
}

#[derive(Debug, Error)]
#[error("unsupported language: {0}")]
pub struct UnknownLanguage(pub String);

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match &s.trim().to_ascii_lowercase()[..] {
            "c" => Ok(Language::C),
            "c++" | "cpp" => Ok(Language::Cpp),
            "go" => Ok(Language::Go),
            other => Err(UnknownLanguage(other.to_string())),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Language::C => "c",
            Language::Cpp => "c++",
            Language::Go => "go",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_json_uses_short_id() {
        let t: Target = serde_json::from_str(
            r#"{"name":"png","id":"png-1","language":"c","location":"/tmp","revision":"abc"}"#,
        )
        .unwrap();
        assert_eq!(t.id(), "png-1");
        let back = serde_json::to_value(&t).unwrap();
        assert_eq!(back["id"], "png-1");
    }

    #[test]
    fn language_parse() {
        assert_eq!("C".parse::<Language>().unwrap(), Language::C);
        assert_eq!("c++".parse::<Language>().unwrap(), Language::Cpp);
        assert_eq!("go".parse::<Language>().unwrap(), Language::Go);
        assert!("rust".parse::<Language>().is_err());
    }
}
