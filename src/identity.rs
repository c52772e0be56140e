//! Device identity used when stamping versions

/// Supplies the identifier of the device producing new versions
pub trait IdentityProvider: Send + Sync {
    fn device_id(&self) -> String;
}

/// Identity derived from hostname, platform and architecture.
///
/// Produces `<platform>-<12 hex chars>` so the raw hostname never leaves the machine.
#[derive(Debug, Clone)]
pub struct HostIdentity {
    device_id: String,
}

impl Default for HostIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl HostIdentity {
    pub fn new() -> Self {
        let hostname = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .or_else(|_| std::fs::read_to_string("/etc/hostname").map(|s| s.trim().to_string()))
            .unwrap_or_else(|_| "localhost".to_string());
        Self::from_parts(&hostname, std::env::consts::OS, std::env::consts::ARCH)
    }

    /// Build an identity from explicit host facts
    pub fn from_parts(hostname: &str, platform: &str, arch: &str) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(format!("{}-{}-{}", hostname, platform, arch).as_bytes());
        let hash = hex::encode(hasher.finalize());
        Self {
            device_id: format!("{}-{}", platform, &hash[..12]),
        }
    }
}

impl IdentityProvider for HostIdentity {
    fn device_id(&self) -> String {
        self.device_id.clone()
    }
}

/// Fixed identity, for tests and callers that manage device ids themselves
#[derive(Debug, Clone)]
pub struct StaticIdentity(pub String);

impl StaticIdentity {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self(device_id.into())
    }
}

impl IdentityProvider for StaticIdentity {
    fn device_id(&self) -> String {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_identity_is_stable() {
        let a = HostIdentity::from_parts("box", "linux", "x86_64");
        let b = HostIdentity::from_parts("box", "linux", "x86_64");
        assert_eq!(a.device_id(), b.device_id());
        assert!(a.device_id().starts_with("linux-"));
        assert_eq!(a.device_id().len(), "linux-".len() + 12);
    }

    #[test]
    fn test_host_identity_differs_per_host() {
        let a = HostIdentity::from_parts("box-a", "linux", "x86_64");
        let b = HostIdentity::from_parts("box-b", "linux", "x86_64");
        assert_ne!(a.device_id(), b.device_id());
    }

    #[test]
    fn test_static_identity() {
        assert_eq!(StaticIdentity::new("laptop").device_id(), "laptop");
    }
}
