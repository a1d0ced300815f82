//! Version information reported by the heartbeat.

pub const TVFPOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Revision of the parent <-> worker frame format.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub tvfpool: &'static str,
    pub protocol: u32,
    /// Commit the binary was built from, if provided at build time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_sha: Option<&'static str>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            tvfpool: TVFPOOL_VERSION,
            protocol: PROTOCOL_VERSION,
            git_sha: option_env!("TVFPOOL_GIT_SHA"),
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_info_has_crate_version() {
        let info = VersionInfo::new();
        assert_eq!(info.tvfpool, TVFPOOL_VERSION);
        assert_eq!(info.protocol, PROTOCOL_VERSION);
    }

    #[test]
    fn version_info_serializes_minimal() {
        let info = VersionInfo {
            tvfpool: "0.1.0",
            protocol: 1,
            git_sha: None,
        };
        insta::assert_json_snapshot!(info, @r#"
        {
          "tvfpool": "0.1.0",
          "protocol": 1
        }
        "#);
    }
}
