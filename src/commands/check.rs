use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::api::ListParams;
use kube::{Api, Client};

use autopol::config::Config;

/// Cluster + log-source connectivity diagnostics. The discovery worker
/// itself depends on two things: a Kubernetes API client (C2) and the two
/// configured log sources (C1) — this check validates the former directly
/// and reports the latter's configuration for the operator to confirm.
pub async fn run() -> anyhow::Result<()> {
    println!("Running discovery connectivity checks...\n");

    // 1. Build Kubernetes client from kubeconfig
    print!("  Kubeconfig .................. ");
    let client = match Client::try_default().await {
        Ok(c) => {
            println!("OK");
            c
        }
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot load kubeconfig: {}", e);
        }
    };

    // 2. Verify actual cluster connectivity by fetching server version
    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            println!("\n  Error: {}", e);
            println!("  Hint:  Is the cluster running? Check with: kubectl cluster-info\n");
            return Ok(());
        }
    }

    // 3. List pods permission (needed to refresh C2's identity cache)
    print!("  List pods permission ........ ");
    let pods: Api<Pod> = Api::all(client.clone());
    match pods.list(&ListParams::default().limit(1)).await {
        Ok(_) => println!("OK"),
        Err(e) => println!("FAIL ({})", e),
    }

    // 4. List namespaces permission (needed for the ns_filter/ns_not_filter gate)
    print!("  List namespaces permission .. ");
    let namespaces: Api<Namespace> = Api::all(client.clone());
    match namespaces.list(&ListParams::default()).await {
        Ok(list) => println!("OK ({} namespaces)", list.items.len()),
        Err(e) => println!("FAIL ({})", e),
    }

    // 5. Configured log sources (transport adapters are supplied by the deployment)
    let config = Config::default();
    println!("\n  Network log source .......... {} (flow ingestion)", config.network_log_from);
    println!("  System log source ........... {} (sys-event ingestion)", config.system_log_from);

    println!("\nAll checks completed.");
    Ok(())
}
