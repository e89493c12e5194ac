//! Version information for the gateway.

/// Gateway version from Cargo.toml
pub const GATEWAY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information for the gateway and its child server.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    /// Gateway version.
    pub gateway: &'static str,
    /// Child server name, from its initialize response (if seen).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    /// Child server version, from its initialize response (if seen).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            gateway: GATEWAY_VERSION,
            server_name: None,
            server_version: None,
        }
    }
}

impl VersionInfo {
    /// Create version info with the gateway version only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the child server name.
    pub fn with_server_name(mut self, name: String) -> Self {
        self.server_name = Some(name);
        self
    }

    /// Set the child server version.
    pub fn with_server_version(mut self, version: String) -> Self {
        self.server_version = Some(version);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_info_has_gateway_version() {
        let info = VersionInfo::new();
        assert_eq!(info.gateway, GATEWAY_VERSION);
        assert!(info.server_name.is_none());
        assert!(info.server_version.is_none());
    }

    #[test]
    fn version_info_builder_pattern() {
        let info = VersionInfo::new()
            .with_server_name("github-mcp-server".to_string())
            .with_server_version("0.8.0".to_string());

        assert_eq!(info.server_name, Some("github-mcp-server".to_string()));
        assert_eq!(info.server_version, Some("0.8.0".to_string()));
    }

    #[test]
    fn version_info_serializes_minimal() {
        // Only the gateway field when nothing optional is set
        let info = VersionInfo {
            gateway: "0.1.0",
            server_name: None,
            server_version: None,
        };
        insta::assert_json_snapshot!(info, @r###"
        {
          "gateway": "0.1.0"
        }
        "###);
    }

    #[test]
    fn version_info_serializes_full() {
        let info = VersionInfo {
            gateway: "0.1.0",
            server_name: Some("github-mcp-server".to_string()),
            server_version: Some("0.8.0".to_string()),
        };
        insta::assert_json_snapshot!(info, @r###"
        {
          "gateway": "0.1.0",
          "server_name": "github-mcp-server",
          "server_version": "0.8.0"
        }
        "###);
    }
}
