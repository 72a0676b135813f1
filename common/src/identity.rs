use serde::Deserialize;

use crate::error::IdentityError;

pub const SUBSCRIBE_SUFFIX: &str = "/sub";
pub const PUBLISH_SUFFIX: &str = "/pub";

#[derive(Debug, Deserialize)]
struct DeviceDocument {
    name: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

/// Who this device is on the broker. Built once at startup, read-only after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub name: String,
    pub model: Option<String>,
    pub subscribe_topic: String,
    pub publish_topic: String,
}

impl DeviceIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            subscribe_topic: format!("{name}{SUBSCRIBE_SUFFIX}"),
            publish_topic: format!("{name}{PUBLISH_SUFFIX}"),
            name,
            model: None,
        }
    }

    pub fn from_document(document: &str) -> Result<Self, IdentityError> {
        let document: DeviceDocument = serde_json::from_str(document)?;
        let name = document
            .name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .ok_or(IdentityError::MissingName)?;

        let mut identity = Self::new(name);
        identity.model = document.model;
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn derives_topics_from_name() {
        let identity =
            DeviceIdentity::from_document(r#"{"name":"lamp-7f21","model":"LX-2"}"#).unwrap();

        assert_eq!(identity.name, "lamp-7f21");
        assert_eq!(identity.model.as_deref(), Some("LX-2"));
        assert_eq!(identity.subscribe_topic, "lamp-7f21/sub");
        assert_eq!(identity.publish_topic, "lamp-7f21/pub");
    }

    #[test]
    fn model_is_optional() {
        let identity = DeviceIdentity::from_document(r#"{"name":"node"}"#).unwrap();
        assert_eq!(identity.model, None);
    }

    #[test]
    fn rejects_missing_or_blank_name() {
        assert!(matches!(
            DeviceIdentity::from_document(r#"{"model":"LX-2"}"#),
            Err(IdentityError::MissingName)
        ));
        assert!(matches!(
            DeviceIdentity::from_document(r#"{"name":"  "}"#),
            Err(IdentityError::MissingName)
        ));
    }

    #[test]
    fn rejects_invalid_json() {
        assert!(matches!(
            DeviceIdentity::from_document("{name:"),
            Err(IdentityError::Parse(_))
        ));
    }
}
