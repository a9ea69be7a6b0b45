use crate::error::Result;

/// An installed file-system extension as reported by the filter manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterInfo {
    pub name: String,
    pub altitude: String,
    pub instance_count: u32,
    pub frame_id: u32,
}

/// Extension lifecycle administration.
///
/// Constructed once by the composition root and handed to whatever needs
/// it; a client requires `load` to have succeeded before it connects.
pub trait FilterManager: Send + Sync {
    /// Load the named extension.
    fn load(&self, name: &str) -> Result<()>;

    /// Unload the named extension.
    fn unload(&self, name: &str) -> Result<()>;

    /// Attach an instance to `volume`. Returns the instance name.
    fn attach(&self, name: &str, volume: &str, instance: Option<&str>) -> Result<String>;

    /// Detach `instance` (or the default instance) from `volume`.
    fn detach(&self, name: &str, volume: &str, instance: Option<&str>) -> Result<()>;

    /// List installed extensions.
    fn enumerate(&self) -> Result<Vec<FilterInfo>>;
}
