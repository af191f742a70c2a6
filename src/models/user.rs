//! User profile model returned by `users.get`

use serde::{Deserialize, Deserializer, Serialize};

/// Default profile fields requested from the upstream
pub const DEFAULT_PROFILE_FIELDS: &str =
    "bdate,relation,city,country,deactivated,sex,last_seen,personal";

/// Sex as reported by the upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    Woman,
    Man,
}

/// City or country reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Place {
    pub id: i64,
    pub title: String,
}

/// Last time the user was online
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSeen {
    #[serde(default)]
    pub platform: Option<i64>,
    /// Unix timestamp
    pub time: i64,
}

/// Public profile of an upstream user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub can_access_closed: Option<bool>,
    /// `deleted` or `banned` for deactivated accounts
    #[serde(default)]
    pub deactivated: Option<String>,
    #[serde(default, deserialize_with = "sex_from_code")]
    pub sex: Option<Sex>,
    /// Birth date as `D.M.YYYY` or `D.M`
    #[serde(default)]
    pub bdate: Option<String>,
    #[serde(default)]
    pub city: Option<Place>,
    #[serde(default)]
    pub country: Option<Place>,
    #[serde(default)]
    pub last_seen: Option<LastSeen>,
    /// Relationship status code; 0 means unset
    #[serde(default, deserialize_with = "zero_to_none")]
    pub relation: Option<u8>,
}

impl UserProfile {
    /// Whether the account is deleted or banned
    pub fn is_deactivated(&self) -> bool {
        self.deactivated.is_some()
    }
}

fn zero_to_none<'de, D>(deserializer: D) -> Result<Option<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<u8>::deserialize(deserializer)?;
    Ok(value.filter(|v| *v != 0))
}

fn sex_from_code<'de, D>(deserializer: D) -> Result<Option<Sex>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<u8>::deserialize(deserializer)?;
    Ok(match value {
        Some(1) => Some(Sex::Woman),
        Some(2) => Some(Sex::Man),
        _ => None,
    })
}
