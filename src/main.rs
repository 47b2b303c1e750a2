//! PRStack Kubernetes Operator
//!
//! Reconciles PRStack resources into per-pull-request environments.
//!
//! ## Usage
//!
//! ```bash
//! # Run the operator (requires kubeconfig)
//! prstack-operator --db-uri mongodb://mongodb.pishop-base.svc:27017
//!
//! # Run with custom log level
//! RUST_LOG=debug prstack-operator --db-uri ...
//! ```

use clap::Parser;
use kube::Client;
use prometheus::Registry;
use prstack_operator::leader_election::{self, LeaderElector};
use prstack_operator::metrics::Metrics;
use prstack_operator::{http, OperatorConfig, StackController};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// PRStack Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "prstack-operator")]
#[command(version, about = "Kubernetes operator for per-PR environments")]
struct Args {
    /// Admin connection URI for the shared database cluster (required)
    #[arg(long, env = "DB_URI", default_value = "")]
    db_uri: String,

    /// Database admin user
    #[arg(long, env = "DB_USER", default_value = "admin")]
    db_user: String,

    /// Database admin password
    #[arg(long, env = "DB_PASSWORD", default_value = "password")]
    db_password: String,

    /// Default host suffix for ingress hostnames
    #[arg(long, env = "BASE_DOMAIN", default_value = "shop.pilab.hu")]
    base_domain: String,

    /// Fixed suffix of derived namespace names
    #[arg(long, env = "NAMESPACE_SUFFIX", default_value = "shop-pilab-hu")]
    namespace_suffix: String,

    /// Container registry host
    #[arg(long, env = "REGISTRY", default_value = "ghcr.io")]
    registry: String,

    /// Registry organization holding the service images
    #[arg(long, env = "REGISTRY_ORG", default_value = "pilab-dev")]
    registry_org: String,

    /// Registry user for image pulls (empty skips the pull secret)
    #[arg(long, env = "REGISTRY_USER", default_value = "")]
    registry_user: String,

    /// Registry token for image pulls
    #[arg(long, env = "REGISTRY_TOKEN", default_value = "")]
    registry_token: String,

    /// Registry email for image pulls
    #[arg(long, env = "REGISTRY_EMAIL", default_value = "")]
    registry_email: String,

    /// Ingress class name
    #[arg(long, env = "INGRESS_CLASS", default_value = "traefik")]
    ingress_class: String,

    /// cert-manager cluster issuer (empty disables issuer-driven TLS)
    #[arg(long, env = "CERT_MANAGER_ISSUER", default_value = "")]
    cert_manager_issuer: String,

    /// Router entrypoints annotation value
    #[arg(long, env = "INGRESS_ENTRYPOINTS", default_value = "websecure")]
    ingress_entrypoints: String,

    /// Router TLS annotation value
    #[arg(long, env = "INGRESS_ROUTER_TLS", default_value = "true")]
    ingress_router_tls: String,

    /// Object-store bucket holding backup archives (empty disables listing)
    #[arg(long, env = "BACKUP_BUCKET", default_value = "")]
    backup_bucket: String,

    /// Seconds of inactivity after which a stack is deactivated
    #[arg(long, env = "EXPIRATION_TTL_SECONDS", default_value = "3600")]
    expiration_ttl_seconds: u64,

    /// Metrics bind address
    #[arg(long, default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health probe bind address
    #[arg(long, default_value = "0.0.0.0:8081")]
    probe_addr: String,

    /// Enable leader election for HA deployments
    #[arg(long, default_value = "false")]
    leader_elect: bool,

    /// Namespace for the leader election Lease (auto-detected if empty)
    #[arg(long, default_value = "")]
    leader_elect_namespace: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = Args::parse();

    if args.db_uri.is_empty() {
        error!("--db-uri (or DB_URI) is required");
        std::process::exit(1);
    }

    info!("Starting PRStack operator");
    info!("Base domain: {}", args.base_domain);
    info!("Leader election: {}", args.leader_elect);

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let config = OperatorConfig {
        db_uri: args.db_uri,
        db_user: args.db_user,
        db_password: args.db_password,
        base_domain: args.base_domain,
        namespace_suffix: args.namespace_suffix,
        registry: args.registry,
        registry_org: args.registry_org,
        registry_user: args.registry_user,
        registry_token: args.registry_token,
        registry_email: args.registry_email,
        ingress_class: args.ingress_class,
        cert_manager_issuer: args.cert_manager_issuer,
        ingress_entrypoints: args.ingress_entrypoints,
        ingress_router_tls: args.ingress_router_tls,
        ingress_ssl_redirect: true,
        backup_bucket: args.backup_bucket,
        expiration_ttl: Duration::from_secs(args.expiration_ttl_seconds),
    };

    let registry = Registry::new();
    let metrics = Metrics::default().register(&registry)?;

    // Leader election — acquire lease before starting the controller
    let elector = if args.leader_elect {
        let ns = leader_election::detect_namespace(&args.leader_elect_namespace);
        info!("Leader election namespace: {}", ns);
        let elector = LeaderElector::new(client.clone(), &ns);
        elector.acquire().await?;
        Some(Arc::new(elector))
    } else {
        None
    };

    let controller = Arc::new(StackController::new(client.clone(), config, metrics)?);

    let controller_handle = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            if let Err(e) = controller.run().await {
                error!("Stack controller error: {}", e);
            }
        })
    };

    let http_handle = tokio::spawn(http::serve(
        args.metrics_addr.clone(),
        args.probe_addr.clone(),
        registry,
    ));

    // Periodic lease renewal (no-op future when leader election is disabled)
    let elector_for_renew = elector.clone();
    let renew_handle = tokio::spawn(async move {
        match elector_for_renew {
            Some(e) => loop {
                tokio::time::sleep(e.renew_interval()).await;
                match e.renew().await {
                    Ok(true) => {}
                    Ok(false) => {
                        error!("Lost leader lease");
                        break;
                    }
                    Err(err) => {
                        error!("Failed to renew leader lease: {}", err);
                        break;
                    }
                }
            },
            None => std::future::pending::<()>().await,
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = controller_handle => {
            if let Err(e) = result {
                error!("Stack controller task failed: {}", e);
            }
        }
        result = http_handle => {
            match result {
                Ok(Err(e)) => error!("HTTP server error: {}", e),
                Err(e) => error!("HTTP server task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = renew_handle => {
            error!("Leader lease lost, initiating shutdown");
        }
    }

    // Release the lease before exiting so a standby replica can take over immediately
    if let Some(e) = &elector {
        e.release().await;
    }

    info!("PRStack operator shutting down");
    Ok(())
}
