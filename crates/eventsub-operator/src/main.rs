//! EventSubscription Operator
//!
//! Serves the subscription API and runs the controller that keeps broker
//! queues in line with EventSubscription resources.

use anyhow::{Context, Result};
use clap::Parser;
use eventsub_operator::prelude::*;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt, ResourceExt};
use secrecy::SecretString;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

/// Field manager used for server-side apply
const FIELD_MANAGER: &str = "eventsub-operator";

/// EventSubscription Operator
#[derive(Parser, Debug)]
#[command(name = "eventsub-operator")]
#[command(about = "Kubernetes operator managing RabbitMQ queues for event subscriptions")]
#[command(version)]
struct Args {
    /// Subscription API address
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen_addr: SocketAddr,

    /// Metrics server address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9090")]
    metrics_addr: SocketAddr,

    /// Kubernetes namespace holding the subscription resources
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "default")]
    namespace: String,

    /// RabbitMQ management API base URL
    #[arg(long, env = "RABBITMQ_MANAGEMENT_URL", default_value = "http://localhost:15672")]
    rabbitmq_url: String,

    /// RabbitMQ virtual host
    #[arg(long, env = "RABBITMQ_VHOST", default_value = "/")]
    rabbitmq_vhost: String,

    /// RabbitMQ management user
    #[arg(long, env = "RABBITMQ_USERNAME", default_value = "guest")]
    rabbitmq_username: String,

    /// RabbitMQ management password
    #[arg(long, env = "RABBITMQ_PASSWORD", default_value = "guest", hide_env_values = true)]
    rabbitmq_password: String,

    /// Broker request timeout in seconds
    #[arg(long, env = "BROKER_TIMEOUT_SECS", default_value = "10")]
    broker_timeout_secs: u64,

    /// Capacity of each subscription worker's queue
    #[arg(long, env = "WORKER_QUEUE_CAPACITY", default_value = "64")]
    worker_queue_capacity: usize,

    /// Idle seconds before a subscription worker exits
    #[arg(long, env = "WORKER_IDLE_SECS", default_value = "300")]
    worker_idle_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Do not register the CRD at startup
    #[arg(long, env = "SKIP_CRD_INSTALL", default_value = "false")]
    skip_crd_install: bool,

    /// Print CRD YAML and exit
    #[arg(long)]
    print_crd: bool,
}

impl Args {
    fn management_config(&self) -> ManagementConfig {
        ManagementConfig {
            base_url: self.rabbitmq_url.clone(),
            vhost: self.rabbitmq_vhost.clone(),
            username: self.rabbitmq_username.clone(),
            password: SecretString::from(self.rabbitmq_password.clone()),
            timeout: Duration::from_secs(self.broker_timeout_secs),
        }
    }

    fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            queue_capacity: self.worker_queue_capacity,
            idle_timeout: Duration::from_secs(self.worker_idle_secs),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd {
        print_crd()?;
        return Ok(());
    }

    init_logging(&args)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = %args.namespace,
        vhost = %args.rabbitmq_vhost,
        "Starting EventSubscription operator"
    );

    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_addr).await {
            error!(error = %e, "Metrics server failed");
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    if args.skip_crd_install {
        info!("Skipping CRD installation");
    } else {
        install_crd(client.clone())
            .await
            .context("Failed to register the EventSubscription resource type")?;
    }

    let backend =
        ManagementClient::new(args.management_config()).context("Invalid broker configuration")?;
    let broker = BrokerGateway::new(Arc::new(backend));

    let store = Arc::new(KubeStore::new(client.clone(), &args.namespace));
    let state = Arc::new(ApiState {
        service: SubscriptionService::new(store).with_metrics(ServiceMetrics::new()),
    });
    let listen_addr = args.listen_addr;
    tokio::spawn(async move {
        if let Err(e) = serve(listen_addr, router(state)).await {
            error!(error = %e, "Subscription API failed");
        }
    });

    run_controller(
        client,
        broker,
        ControllerConfig {
            namespace: args.namespace.clone(),
            dispatcher: args.dispatcher_config(),
            cleanup: CleanupPolicy::default(),
        },
    )
    .await
    .context("Controller failed")?;

    Ok(())
}

/// Initialize logging subsystem
fn init_logging(args: &Args) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Start the Prometheus metrics server
async fn start_metrics_server(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    info!(address = %addr, "Starting metrics server");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    std::future::pending::<()>().await;

    Ok(())
}

/// Register the EventSubscription CRD with server-side apply
async fn install_crd(client: Client) -> std::result::Result<(), OperatorError> {
    let api: Api<CustomResourceDefinition> = Api::all(client);
    let crd = EventSubscription::crd();
    let name = crd.name_any();

    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&crd),
    )
    .await
    .map_err(|e| OperatorError::RegistrationFailed(format!("{}: {}", name, e)))?;

    info!(crd = %name, "CRD registered");
    Ok(())
}

/// Print the CRD YAML for installation
fn print_crd() -> Result<()> {
    let crd = EventSubscription::crd();
    let yaml = serde_yaml::to_string(&crd)?;
    println!("{}", yaml);

    Ok(())
}
