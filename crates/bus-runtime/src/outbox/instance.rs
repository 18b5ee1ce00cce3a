//! Identity of this process among instances competing for outbox rows.

/// Provides the identifier used as the lease owner
pub trait InstanceIdProvider: Send + Sync {
    fn instance_id(&self) -> &str;
}

/// Random identifier generated once per provider
#[derive(Debug, Clone)]
pub struct DefaultInstanceIdProvider {
    id: String,
}

impl DefaultInstanceIdProvider {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
        }
    }

    /// Use a fixed identifier, e.g. a host name
    pub fn with_id(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl Default for DefaultInstanceIdProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceIdProvider for DefaultInstanceIdProvider {
    fn instance_id(&self) -> &str {
        &self.id
    }
}
