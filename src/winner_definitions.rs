use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An operator-locked configuration for an exact (type, platform, country,
/// language) tuple. A matching active winner overrides experiment logic;
/// at most one winner may exist per tuple.
#[derive(Clone, Debug, Deserialize, Serialize, sqlx::FromRow)]
pub struct Winner {
    pub id: i32,
    #[serde(rename = "type")]
    #[sqlx(rename = "type")]
    pub winner_type: String,
    pub platform: String,
    pub country_code: String,
    pub language: String,
    pub content: Value,
    pub is_active: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NewWinner {
    #[serde(rename = "type")]
    pub winner_type: String,
    pub platform: String,
    pub country_code: String,
    pub language: String,
    pub content: Value,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}
