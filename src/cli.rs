use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "autopol")]
#[command(about = "Least-privilege network and system policy discovery engine")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check cluster connectivity and permissions
    Check,

    /// Run a single discovery pass and print the synthesized policies
    Discover {
        /// Kubeconfig context identifying the cluster to discover against
        #[arg(long, default_value = "default")]
        cluster: String,
        /// Optional YAML config file overriding the built-in defaults
        #[arg(long)]
        config: Option<String>,
    },

    /// Run the discovery worker continuously with an HTTP control plane
    Serve {
        #[arg(long, default_value = "default")]
        cluster: String,
        #[arg(long)]
        config: Option<String>,
        #[arg(long, default_value = "0.0.0.0:8080")]
        addr: String,
    },

    /// Inspect the policy store
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },

    /// Enumerate kubeconfig contexts available on this host
    Clusters,

    /// Print or validate the daemon configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate self-deployment manifests
    Deploy {
        #[command(subcommand)]
        action: DeployAction,
    },

    /// Generate observability manifests (Services, ServiceMonitors, Grafana dashboard)
    Observability {
        #[command(subcommand)]
        action: ObservabilityAction,
    },
}

#[derive(Subcommand)]
pub enum PolicyAction {
    /// List stored policies, optionally filtered
    List {
        #[arg(long, default_value = "default")]
        cluster: String,
        #[arg(long)]
        namespace: Option<String>,
        #[arg(long)]
        kind: Option<String>,
    },
    /// Show one policy by name
    Show {
        #[arg(long, default_value = "default")]
        cluster: String,
        name: String,
    },
    /// Export every policy in a namespace as YAML
    Export {
        #[arg(long, default_value = "default")]
        cluster: String,
        #[arg(long)]
        namespace: String,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the JSON Schema for the Config struct
    Schema,
    /// Load a config file and report whether it parses
    Validate { path: String },
}

#[derive(Subcommand)]
pub enum DeployAction {
    /// Print all manifests (Namespace + RBAC + Deployments + PDBs)
    GenerateAll,
    /// Print only the RBAC manifests (ServiceAccount/ClusterRole/Binding)
    GenerateRbac,
    /// Print only the Deployment manifests
    GenerateDeployments,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
pub enum ObservabilityAction {
    /// Print all observability manifests (Services + ServiceMonitors + Grafana dashboard)
    GenerateAll,

    /// Print only ServiceMonitor manifests
    GenerateServiceMonitors,

    /// Print only the Grafana dashboard ConfigMap
    GenerateDashboard,
}
