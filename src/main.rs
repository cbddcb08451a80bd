//! pgstack-operator: Kubernetes operator for Postgres clusters, sharded
//! clusters and distributed logs.
//!
//! The three controllers, the admission webhook, the registration
//! configurator and the health probes run as concurrent tokio tasks within
//! a single binary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::Client;
use tracing::info;

use pgstack_operator::admission;
use pgstack_operator::configurator::{Configurator, ConfiguratorSettings, KubeRegistrationStore};
use pgstack_operator::controller::{self, Context};
use pgstack_operator::factory::DEFAULT_POSTGRES_IMAGE;
use pgstack_operator::resolver::KubeFinder;
use pgstack_operator::store::{KubeObjectStore, ObjectStore};
use pgstack_operator::version::OperatorVersion;
use pgstack_operator::webhook::{self, Webhooks};

#[derive(Parser, Debug)]
#[command(
    name = "pgstack-operator",
    about = "Kubernetes operator for Postgres clusters"
)]
struct Args {
    /// Name of the operator Service; webhook registrations are named after it.
    #[arg(long, default_value = "pgstack-operator", env = "OPERATOR_NAME")]
    operator_name: String,

    /// Namespace where the operator is deployed.
    #[arg(long, env = "OPERATOR_NAMESPACE")]
    operator_namespace: String,

    /// Operator version selecting generators and admission entries
    /// (MAJOR.MINOR). Defaults to the binary version.
    #[arg(long, env = "OPERATOR_VERSION")]
    operator_version: Option<String>,

    /// Patroni/Postgres container image.
    #[arg(long, default_value = DEFAULT_POSTGRES_IMAGE, env = "POSTGRES_IMAGE")]
    postgres_image: String,

    /// Port for the admission webhook HTTPS server.
    #[arg(long, default_value = "9443", env = "WEBHOOK_PORT")]
    webhook_port: u16,

    /// Path to the TLS certificate for the webhook server. Also published
    /// as the CA bundle of every webhook registration.
    #[arg(
        long,
        default_value = "/tmp/k8s-webhook-server/serving-certs/tls.crt",
        env = "WEBHOOK_TLS_CERT"
    )]
    webhook_tls_cert: String,

    /// Path to the TLS key for the webhook server.
    #[arg(
        long,
        default_value = "/tmp/k8s-webhook-server/serving-certs/tls.key",
        env = "WEBHOOK_TLS_KEY"
    )]
    webhook_tls_key: String,

    /// Bind address for health probe endpoints (/healthz, /readyz).
    #[arg(long, default_value = ":8081", env = "HEALTH_PROBE_BIND_ADDRESS")]
    health_probe_bind_address: String,

    /// Seconds between webhook registration sync passes.
    #[arg(
        long,
        default_value = "300",
        env = "CONFIGURATOR_INTERVAL",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    configurator_interval: u64,

    /// Log format: "text" for human-readable, "json" for structured.
    #[arg(long, default_value = "text", env = "LOG_FORMAT")]
    log_format: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,kube=warn,hyper=warn,tower=warn,warp=warn".into());

    if args.log_format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let version = match &args.operator_version {
        Some(v) => v.parse::<OperatorVersion>()?,
        None => OperatorVersion::current(),
    };

    let client = Client::try_default().await?;

    info!(
        %version,
        image = %args.postgres_image,
        ns = %args.operator_namespace,
        "starting pgstack-operator"
    );

    // Registries and pipelines are resolved for the running version up
    // front: an ambiguous registration stops the operator here.
    let webhooks = Webhooks {
        cluster: Arc::new(admission::cluster::pipeline(
            version,
            Arc::new(KubeFinder::new(client.clone())),
            Arc::new(KubeFinder::new(client.clone())),
        )?),
        sharded_cluster: Arc::new(admission::sharded_cluster::pipeline(
            version,
            Arc::new(KubeFinder::new(client.clone())),
        )?),
        distributed_logs: Arc::new(admission::distributed_logs::pipeline(
            version,
            Arc::new(KubeFinder::new(client.clone())),
        )?),
        instance_profile: Arc::new(admission::instance_profile::pipeline(
            version,
            Arc::new(KubeFinder::new(client.clone())),
            Arc::new(KubeFinder::new(client.clone())),
        )?),
    };

    let store: Arc<dyn ObjectStore> = Arc::new(KubeObjectStore::new(client.clone()));
    let clusters = Arc::new(Context {
        client: client.clone(),
        conciliator: controller::cluster::conciliator(
            client.clone(),
            store.clone(),
            version,
            &args.postgres_image,
        )?,
        version,
    });
    let distributed_logs = Arc::new(Context {
        client: client.clone(),
        conciliator: controller::distributed_logs::conciliator(
            client.clone(),
            store.clone(),
            version,
            &args.postgres_image,
        )?,
        version,
    });
    let sharded_clusters = Arc::new(Context {
        client: client.clone(),
        conciliator: controller::sharded_cluster::conciliator(client.clone(), store, version)?,
        version,
    });

    // The operator must not serve traffic without a valid registration.
    let configurator = Configurator::new(
        KubeRegistrationStore::new(client),
        ConfiguratorSettings {
            operator_name: args.operator_name,
            operator_namespace: args.operator_namespace,
            certificate_path: PathBuf::from(&args.webhook_tls_cert),
        },
    );
    configurator.sync().await?;

    let webhook_addr = std::net::SocketAddr::from(([0, 0, 0, 0], args.webhook_port));
    let tls_cert = args.webhook_tls_cert;
    let tls_key = args.webhook_tls_key;

    // Parse health probe bind address (e.g. ":8081" or "0.0.0.0:8081").
    let health_addr: std::net::SocketAddr = args
        .health_probe_bind_address
        .strip_prefix(':')
        .map(|port| format!("0.0.0.0:{port}"))
        .unwrap_or_else(|| args.health_probe_bind_address.clone())
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid --health-probe-bind-address: {e}"))?;

    tokio::select! {
        _ = controller::cluster::run(clusters) => {},
        _ = controller::distributed_logs::run(distributed_logs) => {},
        _ = controller::sharded_cluster::run(sharded_clusters) => {},
        _ = configurator.run(Duration::from_secs(args.configurator_interval)) => {},
        _ = webhooks.run(webhook_addr, &tls_cert, &tls_key) => {},
        _ = warp::serve(webhook::health_routes()).run(health_addr) => {},
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(interval: &str) -> Result<Args, clap::Error> {
        Args::try_parse_from([
            "pgstack-operator",
            "--operator-namespace",
            "ops",
            "--configurator-interval",
            interval,
        ])
    }

    #[test]
    fn test_configurator_interval_must_be_positive() {
        assert!(parse("0").is_err());
        assert_eq!(parse("30").unwrap().configurator_interval, 30);
    }
}
