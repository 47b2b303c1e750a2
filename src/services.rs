//! Service registry: the workload catalog the operator knows how to deploy.
//!
//! Each service maps to a database schema (collections plus indexes, asserted
//! during provisioning) and an environment renderer used by the Deploying
//! branch. Both are data-driven lookups keyed by the logical service name;
//! an unknown name is a hard error, never silently skipped.

use k8s_openapi::api::core::v1::{EnvVar, EnvVarSource, SecretKeySelector};

use crate::config::OperatorConfig;
use crate::crd::{PRStack, StackSpec};
use crate::error::{OperatorError, Result};
use crate::names;

/// The default workload set, deployed when `spec.services` is empty.
pub const DEFAULT_SERVICES: [&str; 12] = [
    "products-service",
    "cart-service",
    "orders-service",
    "payments-service",
    "customers-service",
    "inventory-service",
    "notifications-service",
    "discounts-service",
    "checkout-service",
    "analytics-service",
    "auth-service",
    "graphql-service",
];

/// The one workload whose Service receives an Ingress.
pub const FRONT_DOOR_SERVICE: &str = "graphql-service";

/// Effective service set: `spec.services`, or the default set verbatim.
pub fn effective_services(spec: &StackSpec) -> Vec<String> {
    if spec.services.is_empty() {
        DEFAULT_SERVICES.iter().map(|s| s.to_string()).collect()
    } else {
        spec.services.clone()
    }
}

/// The front-door for a given effective set: `graphql-service` when present,
/// otherwise the first service.
pub fn front_door(services: &[String]) -> Option<&str> {
    if services.iter().any(|s| s == FRONT_DOOR_SERVICE) {
        Some(FRONT_DOOR_SERVICE)
    } else {
        services.first().map(|s| s.as_str())
    }
}

/// One index to assert on a collection.
#[derive(Debug, Clone, Copy)]
pub struct IndexSpec {
    pub key: &'static str,
    pub unique: bool,
}

/// One collection with its index set.
#[derive(Debug, Clone, Copy)]
pub struct CollectionSpec {
    pub name: &'static str,
    pub indexes: &'static [IndexSpec],
}

const fn idx(key: &'static str) -> IndexSpec {
    IndexSpec { key, unique: false }
}

const fn uniq(key: &'static str) -> IndexSpec {
    IndexSpec { key, unique: true }
}

/// Collection and index set for a logical service name.
///
/// Returns `None` for unknown names; callers must treat that as a hard error.
pub fn collection_set(logical: &str) -> Option<&'static [CollectionSpec]> {
    const PRODUCTS: &[CollectionSpec] = &[
        CollectionSpec {
            name: "products",
            indexes: &[uniq("slug"), uniq("sku"), idx("category_id"), idx("is_active")],
        },
        CollectionSpec { name: "categories", indexes: &[uniq("slug")] },
        CollectionSpec { name: "collections", indexes: &[uniq("slug")] },
    ];
    const CART: &[CollectionSpec] = &[
        CollectionSpec { name: "carts", indexes: &[uniq("user_id"), idx("session_id")] },
        CollectionSpec { name: "cart_items", indexes: &[idx("cart_id")] },
    ];
    const ORDERS: &[CollectionSpec] = &[
        CollectionSpec {
            name: "orders",
            indexes: &[uniq("order_number"), idx("user_id"), idx("status"), idx("created_at")],
        },
        CollectionSpec { name: "order_items", indexes: &[idx("order_id")] },
        CollectionSpec { name: "order_status_history", indexes: &[idx("order_id")] },
    ];
    const PAYMENTS: &[CollectionSpec] = &[
        CollectionSpec {
            name: "payments",
            indexes: &[idx("order_id"), idx("user_id"), idx("status")],
        },
        CollectionSpec { name: "payment_methods", indexes: &[idx("user_id")] },
        CollectionSpec { name: "payment_transactions", indexes: &[idx("payment_id")] },
    ];
    const CUSTOMERS: &[CollectionSpec] = &[
        CollectionSpec { name: "customers", indexes: &[uniq("email"), uniq("user_id")] },
        CollectionSpec { name: "customer_addresses", indexes: &[idx("customer_id")] },
        CollectionSpec { name: "customer_preferences", indexes: &[idx("customer_id")] },
    ];
    const INVENTORY: &[CollectionSpec] = &[
        CollectionSpec { name: "inventory_items", indexes: &[uniq("product_id"), idx("sku")] },
        CollectionSpec { name: "stock_movements", indexes: &[idx("product_id"), idx("created_at")] },
        CollectionSpec { name: "reservations", indexes: &[idx("product_id")] },
    ];
    const NOTIFICATIONS: &[CollectionSpec] = &[
        CollectionSpec {
            name: "notifications",
            indexes: &[idx("user_id"), idx("type"), idx("status"), idx("created_at")],
        },
        CollectionSpec { name: "notification_templates", indexes: &[idx("type")] },
        CollectionSpec { name: "notification_preferences", indexes: &[idx("user_id")] },
    ];
    const DISCOUNTS: &[CollectionSpec] = &[
        CollectionSpec {
            name: "discounts",
            indexes: &[uniq("code"), idx("is_active"), idx("valid_from"), idx("valid_until")],
        },
        CollectionSpec { name: "discount_usage", indexes: &[idx("discount_id")] },
        CollectionSpec { name: "promotion_codes", indexes: &[uniq("code")] },
    ];
    const CHECKOUT: &[CollectionSpec] = &[
        CollectionSpec {
            name: "checkout_sessions",
            indexes: &[uniq("session_id"), idx("user_id"), idx("status")],
        },
        CollectionSpec { name: "checkout_steps", indexes: &[idx("session_id")] },
        CollectionSpec { name: "shipping_options", indexes: &[idx("is_active")] },
    ];
    const ANALYTICS: &[CollectionSpec] = &[CollectionSpec {
        name: "analytics",
        indexes: &[idx("created_at"), idx("event_type"), idx("user_id")],
    }];
    const AUTH: &[CollectionSpec] = &[CollectionSpec {
        name: "users",
        indexes: &[uniq("email"), uniq("username"), idx("created_at")],
    }];
    const GRAPHQL: &[CollectionSpec] = &[CollectionSpec {
        name: "queries",
        indexes: &[idx("created_at"), idx("operation")],
    }];

    match logical {
        "products" => Some(PRODUCTS),
        "cart" => Some(CART),
        "orders" => Some(ORDERS),
        "payments" => Some(PAYMENTS),
        "customers" => Some(CUSTOMERS),
        "inventory" => Some(INVENTORY),
        "notifications" => Some(NOTIFICATIONS),
        "discounts" => Some(DISCOUNTS),
        "checkout" => Some(CHECKOUT),
        "analytics" => Some(ANALYTICS),
        "auth" => Some(AUTH),
        "graphql" => Some(GRAPHQL),
        _ => None,
    }
}

/// Whether the registry knows a workload name.
pub fn is_known_service(service: &str) -> bool {
    collection_set(names::logical_name(service)).is_some()
}

/// Service-specific environment additions, keyed by logical name.
fn service_overrides(logical: &str) -> &'static [(&'static str, &'static str)] {
    match logical {
        "analytics" => &[
            ("ANALYTICS_DATA_RETENTION_DAYS", "365"),
            ("ANALYTICS_BATCH_SIZE", "1000"),
            ("ANALYTICS_REPORT_SCHEDULE", "0 0 * * *"),
        ],
        "cart" => &[
            ("CART_GUEST_EXPIRATION", "72h"),
            ("CART_MERGE_ON_LOGIN", "true"),
        ],
        "checkout" => &[
            ("CHECKOUT_SESSION_TTL", "30m"),
            ("CHECKOUT_PAYMENT_TIMEOUT", "5m"),
        ],
        "auth" => &[
            ("AUTH_TOKEN_TTL", "15m"),
            ("AUTH_REFRESH_TOKEN_TTL", "720h"),
        ],
        "inventory" => &[
            ("INVENTORY_LOW_STOCK_THRESHOLD", "10"),
            ("INVENTORY_RESERVATION_TTL", "15m"),
        ],
        "notifications" => &[
            ("NOTIFICATIONS_BATCH_SIZE", "100"),
            ("NOTIFICATIONS_RETRY_ATTEMPTS", "3"),
        ],
        "graphql" => &[
            ("GRAPHQL_PLAYGROUND_ENABLED", "true"),
            ("GRAPHQL_MAX_QUERY_DEPTH", "12"),
        ],
        _ => &[],
    }
}

fn env(name: &str, value: String) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value),
        ..Default::default()
    }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Render the container environment for one service of a stack.
///
/// Credentials are referenced by secret key, never inlined. The bus and cache
/// coordinates come from status when present and are re-derived otherwise, so
/// rendering stays deterministic across replays.
pub fn render_service_env(
    service: &str,
    stack: &PRStack,
    config: &OperatorConfig,
) -> Result<Vec<EnvVar>> {
    let logical = names::logical_name(service);
    if collection_set(logical).is_none() {
        return Err(OperatorError::Validation(format!(
            "unknown service '{}'",
            service
        )));
    }

    let stack_id = &stack.spec.stack_id;
    let namespace = names::namespace_name(stack_id, &config.namespace_suffix);
    let status = stack.status.as_ref();

    let bus_url = status
        .and_then(|s| s.message_bus.as_ref())
        .map(|b| b.url.clone())
        .unwrap_or_else(|| names::bus_url(&namespace));
    let bus_prefix = status
        .and_then(|s| s.message_bus.as_ref())
        .map(|b| b.subject_prefix.clone())
        .unwrap_or_else(|| names::bus_subject_prefix(stack_id));
    let cache_url = status
        .and_then(|s| s.cache.as_ref())
        .map(|c| c.url.clone())
        .unwrap_or_else(|| names::cache_url(&namespace));
    let cache_prefix = status
        .and_then(|s| s.cache.as_ref())
        .map(|c| c.key_prefix.clone())
        .unwrap_or_else(|| names::cache_key_prefix(stack_id));

    let environment = stack
        .spec
        .environment
        .clone()
        .unwrap_or_else(|| "pr".to_string());

    let mut vars = vec![
        env("SERVICE_NAME", service.to_string()),
        env("STACK_ID", stack_id.clone()),
        env("ENVIRONMENT", environment),
        env("LOG_LEVEL", "info".to_string()),
        env("SERVER_PORT", "8080".to_string()),
        env("MONGODB_DATABASE", names::database_name(service, stack_id)),
        secret_env("MONGODB_URI", crate::resources::DB_SECRET_NAME, "connectionString"),
        secret_env("MONGODB_USERNAME", crate::resources::DB_SECRET_NAME, "username"),
        secret_env("MONGODB_PASSWORD", crate::resources::DB_SECRET_NAME, "password"),
        env("BUS_URL", bus_url),
        env("BUS_SUBJECT_PREFIX", bus_prefix),
        env("CACHE_URL", cache_url),
        env("CACHE_KEY_PREFIX", cache_prefix),
        env("CACHE_DATABASE", "0".to_string()),
        env("METRICS_ENABLED", "true".to_string()),
        env("METRICS_PATH", "/metrics".to_string()),
        env("HEALTH_PATH", "/health".to_string()),
    ];

    for (name, value) in service_overrides(logical) {
        vars.push(env(name, value.to_string()));
    }

    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack(spec_json: &str) -> PRStack {
        PRStack::new("test", serde_json::from_str(spec_json).unwrap())
    }

    #[test]
    fn test_default_set_is_substituted_verbatim() {
        let spec: StackSpec = serde_json::from_str(r#"{"stackID": "42"}"#).unwrap();
        let services = effective_services(&spec);
        assert_eq!(services.len(), 12);
        assert_eq!(services[0], "products-service");
        assert!(services.iter().all(|s| s.ends_with("-service")));
    }

    #[test]
    fn test_explicit_services_win() {
        let spec: StackSpec =
            serde_json::from_str(r#"{"stackID": "42", "services": ["products-service"]}"#).unwrap();
        assert_eq!(effective_services(&spec), vec!["products-service"]);
    }

    #[test]
    fn test_every_default_service_has_a_schema() {
        for service in DEFAULT_SERVICES {
            assert!(is_known_service(service), "no schema for {}", service);
        }
    }

    #[test]
    fn test_unknown_service_is_rejected() {
        assert!(!is_known_service("mystery-service"));
        assert!(collection_set("mystery").is_none());
    }

    #[test]
    fn test_products_schema() {
        let set = collection_set("products").unwrap();
        let products = set.iter().find(|c| c.name == "products").unwrap();
        let slug = products.indexes.iter().find(|i| i.key == "slug").unwrap();
        assert!(slug.unique);
        assert!(products.indexes.iter().any(|i| i.key == "category_id" && !i.unique));
    }

    #[test]
    fn test_front_door_prefers_graphql() {
        let all: Vec<String> = DEFAULT_SERVICES.iter().map(|s| s.to_string()).collect();
        assert_eq!(front_door(&all), Some("graphql-service"));

        let only_products = vec!["products-service".to_string()];
        assert_eq!(front_door(&only_products), Some("products-service"));

        assert_eq!(front_door(&[]), None);
    }

    #[test]
    fn test_render_service_env() {
        let stack = stack(r#"{"stackID": "42"}"#);
        let config = OperatorConfig::default();
        let vars = render_service_env("products-service", &stack, &config).unwrap();

        let get = |name: &str| vars.iter().find(|v| v.name == name);
        assert_eq!(
            get("MONGODB_DATABASE").unwrap().value.as_deref(),
            Some("pishop_products_pr_42")
        );
        assert_eq!(
            get("BUS_SUBJECT_PREFIX").unwrap().value.as_deref(),
            Some("pishop.pr.42")
        );
        // Credentials come from the secret, never inline
        let uri = get("MONGODB_URI").unwrap();
        assert!(uri.value.is_none());
        assert!(uri.value_from.is_some());
    }

    #[test]
    fn test_render_rejects_unknown_service() {
        let stack = stack(r#"{"stackID": "42"}"#);
        let config = OperatorConfig::default();
        assert!(render_service_env("mystery-service", &stack, &config).is_err());
    }

    #[test]
    fn test_render_uses_status_coordinates_when_present() {
        let mut stack = stack(r#"{"stackID": "42"}"#);
        stack.status = Some(crate::crd::StackStatus {
            message_bus: Some(crate::crd::MessageBusCoordinates {
                subject_prefix: "pishop.pr.42".to_string(),
                url: "nats://elsewhere:4222".to_string(),
            }),
            ..Default::default()
        });
        let vars = render_service_env("auth-service", &stack, &OperatorConfig::default()).unwrap();
        let bus = vars.iter().find(|v| v.name == "BUS_URL").unwrap();
        assert_eq!(bus.value.as_deref(), Some("nats://elsewhere:4222"));
    }
}
