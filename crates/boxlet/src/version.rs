//! Version information for boxlet.

/// Boxlet version from Cargo.toml
pub const BOXLET_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported by the admin channel.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct VersionInfo {
    pub boxlet: &'static str,
    /// Application name given to the builder.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            boxlet: BOXLET_VERSION,
            app: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_app(mut self, name: impl Into<String>) -> Self {
        self.app = Some(name.into());
        self
    }
}
