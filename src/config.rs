//! Process-level operator configuration.

use std::time::Duration;

/// Operator-wide settings assembled from CLI flags and environment in `main`.
///
/// The controller treats this as read-only; per-stack overrides
/// (`spec.dbURI`, `spec.customDomain`, ...) take precedence where documented.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Admin connection URI for the shared database cluster
    pub db_uri: String,
    /// Admin user
    pub db_user: String,
    /// Admin password
    pub db_password: String,
    /// Default host suffix for ingress hostnames
    pub base_domain: String,
    /// Fixed suffix of derived namespace names
    pub namespace_suffix: String,
    /// Container registry host
    pub registry: String,
    /// Registry organization holding the service images
    pub registry_org: String,
    /// Image-pull credentials (empty disables the registry secret)
    pub registry_user: String,
    pub registry_token: String,
    pub registry_email: String,
    /// Ingress class name
    pub ingress_class: String,
    /// cert-manager cluster issuer; empty disables issuer-driven TLS
    pub cert_manager_issuer: String,
    /// Router entrypoints annotation value; empty omits the annotation
    pub ingress_entrypoints: String,
    /// Router TLS annotation value; empty omits the annotation
    pub ingress_router_tls: String,
    /// Emit the SSL-redirect annotation on ingresses
    pub ingress_ssl_redirect: bool,
    /// Object-store bucket holding backup archives; empty disables enumeration
    pub backup_bucket: String,
    /// Idle time after which an active stack is deactivated
    pub expiration_ttl: Duration,
}

impl OperatorConfig {
    /// Whether image-pull credentials were provided.
    pub fn registry_configured(&self) -> bool {
        !self.registry_user.is_empty() && !self.registry_token.is_empty()
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            db_uri: String::new(),
            db_user: "admin".to_string(),
            db_password: "password".to_string(),
            base_domain: "shop.pilab.hu".to_string(),
            namespace_suffix: "shop-pilab-hu".to_string(),
            registry: "ghcr.io".to_string(),
            registry_org: "pilab-dev".to_string(),
            registry_user: String::new(),
            registry_token: String::new(),
            registry_email: String::new(),
            ingress_class: "traefik".to_string(),
            cert_manager_issuer: String::new(),
            ingress_entrypoints: "websecure".to_string(),
            ingress_router_tls: "true".to_string(),
            ingress_ssl_redirect: true,
            backup_bucket: String::new(),
            expiration_ttl: Duration::from_secs(3600),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OperatorConfig::default();
        assert_eq!(config.base_domain, "shop.pilab.hu");
        assert_eq!(config.namespace_suffix, "shop-pilab-hu");
        assert_eq!(config.expiration_ttl, Duration::from_secs(3600));
        assert!(!config.registry_configured());
    }

    #[test]
    fn test_registry_configured_requires_user_and_token() {
        let mut config = OperatorConfig {
            registry_user: "bot".to_string(),
            ..Default::default()
        };
        assert!(!config.registry_configured());
        config.registry_token = "token".to_string();
        assert!(config.registry_configured());
    }
}
