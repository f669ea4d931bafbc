use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use crate::api::ConfigError;

/// Who the configuration is being resolved for. Everything downstream
/// depends only on these three fields, never on a concrete user/device
/// model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    pub principal_id: String,
    pub principal_type: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetingAttributes {
    pub platform: Option<String>,
    pub country: Option<String>,
    pub language: Option<String>,
}

/// Ordered fallback chains per targeting attribute: a direct request
/// field wins, then each property name is tried in order until one
/// yields a non-null value. Kept as an explicit table, not reflection.
const PLATFORM_FIELDS: &[&str] = &["platform", "os"];
const COUNTRY_FIELDS: &[&str] = &["country", "country_code", "geo_country_code"];
const LANGUAGE_FIELDS: &[&str] = &["language", "lang"];

#[derive(Deserialize, Default)]
pub struct ConfigQueryParams {
    #[serde(alias = "v")]
    pub version: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct ClearOverridesParams {
    #[serde(rename = "type")]
    pub config_type: Option<String>,
}

#[derive(Default, Debug, Deserialize, Serialize)]
pub struct ConfigRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal_id: Option<String>,
    #[serde(default = "default_principal_type")]
    pub principal_type: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub config_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Free-form principal properties, consulted through the fallback
    /// chains when the direct fields above are absent.
    #[serde(default)]
    pub properties: Option<HashMap<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal_created_at: Option<DateTime<Utc>>,
}

fn default_principal_type() -> String {
    "user".to_string()
}

impl ConfigRequest {
    /// Takes a request payload and tries to unmarshall it.
    #[instrument(skip_all)]
    pub fn from_bytes(bytes: Bytes) -> Result<ConfigRequest, ConfigError> {
        tracing::debug!(len = bytes.len(), "decoding new request");
        let payload = String::from_utf8(bytes.into()).map_err(|e| {
            tracing::error!("failed to decode body: {}", e);
            ConfigError::RequestDecodingError(String::from("invalid body encoding"))
        })?;

        Ok(serde_json::from_str::<ConfigRequest>(&payload)?)
    }

    pub fn extract_config_type(&self) -> Result<String, ConfigError> {
        match self.config_type.as_deref().map(str::trim) {
            Some(t) if !t.is_empty() => Ok(t.to_string()),
            _ => Err(ConfigError::EmptyConfigType),
        }
    }

    pub fn extract_principal(&self) -> Result<Principal, ConfigError> {
        let principal_id = match self.principal_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => return Err(ConfigError::MissingPrincipalId),
        };

        Ok(Principal {
            principal_id,
            principal_type: self.principal_type.clone(),
            created_at: self.principal_created_at,
        })
    }

    pub fn extract_targeting_attributes(&self) -> TargetingAttributes {
        TargetingAttributes {
            platform: self.attribute(self.platform.as_ref(), PLATFORM_FIELDS),
            country: self.attribute(self.country.as_ref(), COUNTRY_FIELDS),
            language: self.attribute(self.language.as_ref(), LANGUAGE_FIELDS),
        }
    }

    fn attribute(&self, direct: Option<&String>, fields: &[&str]) -> Option<String> {
        if let Some(value) = direct {
            if !value.trim().is_empty() {
                return Some(value.clone());
            }
        }

        let properties = self.properties.as_ref()?;
        for field in fields {
            if let Some(Value::String(value)) = properties.get(*field) {
                if !value.trim().is_empty() {
                    return Some(value.clone());
                }
            }
        }
        None
    }
}

#[derive(Default, Debug, Deserialize, Serialize)]
pub struct ConfirmRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal_id: Option<String>,
    #[serde(default = "default_principal_type")]
    pub principal_type: String,
    pub experiment_id: Option<i32>,
    pub flow_id: Option<i32>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl ConfirmRequest {
    pub fn from_bytes(bytes: Bytes) -> Result<ConfirmRequest, ConfigError> {
        let payload = String::from_utf8(bytes.into()).map_err(|e| {
            tracing::error!("failed to decode body: {}", e);
            ConfigError::RequestDecodingError(String::from("invalid body encoding"))
        })?;

        Ok(serde_json::from_str::<ConfirmRequest>(&payload)?)
    }

    pub fn extract_principal(&self) -> Result<Principal, ConfigError> {
        let principal_id = match self.principal_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => return Err(ConfigError::MissingPrincipalId),
        };

        Ok(Principal {
            principal_id,
            principal_type: self.principal_type.clone(),
            created_at: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request_from(v: Value) -> ConfigRequest {
        ConfigRequest::from_bytes(Bytes::from(v.to_string())).unwrap()
    }

    #[test]
    fn blank_config_type_is_a_caller_error() {
        let request = request_from(json!({"principal_id": "u1"}));
        assert!(matches!(
            request.extract_config_type(),
            Err(ConfigError::EmptyConfigType)
        ));

        let request = request_from(json!({"principal_id": "u1", "type": "  "}));
        assert!(matches!(
            request.extract_config_type(),
            Err(ConfigError::EmptyConfigType)
        ));

        let request = request_from(json!({"principal_id": "u1", "type": "onboarding"}));
        assert_eq!(request.extract_config_type().unwrap(), "onboarding");
    }

    #[test]
    fn direct_fields_win_over_properties() {
        let request = request_from(json!({
            "principal_id": "u1",
            "type": "onboarding",
            "platform": "ios",
            "properties": {"os": "android", "country_code": "US", "lang": "en"}
        }));

        let attrs = request.extract_targeting_attributes();
        assert_eq!(attrs.platform.as_deref(), Some("ios"));
        assert_eq!(attrs.country.as_deref(), Some("US"));
        assert_eq!(attrs.language.as_deref(), Some("en"));
    }

    #[test]
    fn fallback_chain_is_tried_in_order() {
        let request = request_from(json!({
            "principal_id": "u1",
            "type": "onboarding",
            "properties": {
                "country": "FR",
                "country_code": "US",
                "geo_country_code": "DE"
            }
        }));

        let attrs = request.extract_targeting_attributes();
        // first name in the chain that yields a value wins
        assert_eq!(attrs.country.as_deref(), Some("FR"));
        assert_eq!(attrs.platform, None);
    }

    #[test]
    fn non_string_and_blank_properties_are_skipped() {
        let request = request_from(json!({
            "principal_id": "u1",
            "type": "onboarding",
            "properties": {"platform": 42, "os": "android", "language": "  ", "lang": "ar"}
        }));

        let attrs = request.extract_targeting_attributes();
        assert_eq!(attrs.platform.as_deref(), Some("android"));
        assert_eq!(attrs.language.as_deref(), Some("ar"));
    }

    #[test]
    fn principal_defaults_to_user_type() {
        let request = request_from(json!({
            "principal_id": "u1",
            "type": "onboarding",
            "principal_created_at": "2024-05-01T12:00:00Z"
        }));

        let principal = request.extract_principal().unwrap();
        assert_eq!(principal.principal_type, "user");
        assert!(principal.created_at.is_some());

        let request = request_from(json!({"type": "onboarding"}));
        assert!(matches!(
            request.extract_principal(),
            Err(ConfigError::MissingPrincipalId)
        ));
    }
}
