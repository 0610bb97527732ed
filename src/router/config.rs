use bon::Builder;

/// Request field read as the routing key unless configured otherwise.
pub const DEFAULT_KEY_FIELD: &str = "name";

/// Configuration for the [`Router`](crate::router::Router).
#[derive(Debug, Clone, Builder)]
pub struct RouterConfig {
    /// Request field holding the routing key for services built with
    /// [`Router::new_routed_service`](crate::router::Router::new_routed_service).
    #[builder(default = DEFAULT_KEY_FIELD.to_string())]
    pub key_field: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
