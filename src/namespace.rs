//! Image/container/network namespacing
//!
//! Every docker object the harness touches is named inside a
//! (prefix, suffix) namespace so that independent deployments can share a
//! host without colliding.

/// Default namespace, matching the stock HCP image naming.
pub const DEFAULT_PREFIX: &str = "safeboot_hcp_";
pub const DEFAULT_SUFFIX: &str = "devel";

/// Immutable naming namespace. Value-like; never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    prefix: String,
    suffix: String,
}

impl Namespace {
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Fully-qualified image reference: `<prefix><name>:<suffix>`.
    pub fn image_name(&self, name: &str) -> String {
        format!("{}{}:{}", self.prefix, name, self.suffix)
    }

    /// Name for non-image objects (containers, networks): `<prefix><name><suffix>`.
    pub fn object_name(&self, name: &str) -> String {
        format!("{}{}{}", self.prefix, name, self.suffix)
    }

    /// Name of the shared network for this namespace.
    pub fn network_name(&self) -> String {
        self.object_name("network")
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX, DEFAULT_SUFFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_names_carry_tag_separator() {
        let ns = Namespace::new("foo_", "bar");
        assert_eq!(ns.image_name("swtpmsvc"), "foo_swtpmsvc:bar");
        assert_eq!(ns.object_name("swtpmsvc0"), "foo_swtpmsvc0bar");
        assert_eq!(ns.network_name(), "foo_networkbar");
    }

    #[test]
    fn default_namespace_matches_stock_images() {
        let ns = Namespace::default();
        assert_eq!(ns.image_name("client"), "safeboot_hcp_client:devel");
    }
}
