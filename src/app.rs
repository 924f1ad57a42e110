//! Application identity presented to the server in the connect packet.

use serde::{Deserialize, Serialize};

use crate::core::identifier::Identifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppType {
    App,
    /// Runs outside the broker's trust boundary; always encrypts when it can
    Remote,
    Plugin,
    Dashboard,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct App {
    pub id: Identifier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<AppType>,
}

impl App {
    pub fn new(id: Identifier) -> Self {
        Self {
            id,
            version: None,
            url: None,
            kind: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_kind(mut self, kind: AppType) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn is_remote(&self) -> bool {
        self.kind == Some(AppType::Remote)
    }
}
