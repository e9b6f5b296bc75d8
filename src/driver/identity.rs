use crate::driver::{Context, DriverResult};
use async_trait::async_trait;

/// Applies a browsing identity (user agent, headers, fingerprint) to a context
///
/// Anything beyond a static user agent is left to external implementations.
#[async_trait]
pub trait IdentityConfigurator: Send + Sync {
    async fn apply(&self, context: &dyn Context) -> DriverResult<()>;
}

/// Sets one fixed user agent on every context
#[derive(Debug, Clone)]
pub struct StaticIdentity {
    user_agent: String,
}

impl StaticIdentity {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
        }
    }
}

#[async_trait]
impl IdentityConfigurator for StaticIdentity {
    async fn apply(&self, context: &dyn Context) -> DriverResult<()> {
        context.set_user_agent(&self.user_agent).await
    }
}
