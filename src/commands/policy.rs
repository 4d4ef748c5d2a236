use anyhow::Result;

use autopol::store::{PolicyQuery, PolicyStore};
use autopol::types::{PolicyKind, PolicyLike};

use crate::cli::PolicyAction;

use super::discover::{load_config, run_once};

fn parse_kind(raw: &str) -> Result<PolicyKind> {
    match raw {
        "network" => Ok(PolicyKind::Network),
        "system" => Ok(PolicyKind::System),
        other => anyhow::bail!("unknown policy kind '{other}', expected 'network' or 'system'"),
    }
}

/// Every `policy` subcommand runs a fresh one-shot discovery pass and then
/// queries the resulting store, since C6's in-memory backing doesn't
/// outlive a process (see DESIGN.md).
pub async fn run(action: PolicyAction) -> Result<()> {
    match action {
        PolicyAction::List { cluster, namespace, kind } => list(&cluster, namespace, kind).await,
        PolicyAction::Show { cluster, name } => show(&cluster, &name).await,
        PolicyAction::Export { cluster, namespace } => export(&cluster, &namespace).await,
    }
}

async fn list(cluster: &str, namespace: Option<String>, kind: Option<String>) -> Result<()> {
    let store = run_once(cluster, load_config(None)?).await?;

    let filter = PolicyQuery {
        cluster: Some(cluster.to_string()),
        namespace,
        kind: kind.as_deref().map(parse_kind).transpose()?,
        ..Default::default()
    };
    let policies = store.query(&filter).await?;

    if policies.is_empty() {
        println!("No policies found for cluster '{cluster}'");
        return Ok(());
    }

    println!("{:<40} {:<10} {:<20} {:<10} STATUS", "NAME", "KIND", "NAMESPACE", "RULE TYPE");
    println!("{}", "-".repeat(100));
    for policy in &policies {
        let kind = match policy.kind {
            PolicyKind::Network => "network",
            PolicyKind::System => "system",
        };
        println!(
            "{:<40} {:<10} {:<20} {:<10} {:?}",
            policy.name, kind, policy.namespace, policy.rule_type, policy.status
        );
    }
    Ok(())
}

async fn show(cluster: &str, name: &str) -> Result<()> {
    let store = run_once(cluster, load_config(None)?).await?;

    match store.get(name).await? {
        Some(policy) => {
            println!("Name: {}", policy.name);
            println!("Kind: {:?}", policy.kind);
            println!("Cluster: {}", policy.cluster);
            println!("Namespace: {}", policy.namespace);
            println!("Status: {:?}", policy.status);
            println!();
            let yaml = serde_yaml::to_string(&policy.spec)?;
            println!("Spec:");
            for line in yaml.lines() {
                println!("  {line}");
            }
            Ok(())
        }
        None => anyhow::bail!("no such policy '{name}' in cluster '{cluster}'"),
    }
}

async fn export(cluster: &str, namespace: &str) -> Result<()> {
    let store = run_once(cluster, load_config(None)?).await?;

    let filter = PolicyQuery { cluster: Some(cluster.to_string()), namespace: Some(namespace.to_string()), ..Default::default() };
    let policies = store.query(&filter).await?;

    if policies.is_empty() {
        println!("No policies found in namespace '{namespace}' for cluster '{cluster}'");
        return Ok(());
    }

    let mut first = true;
    for policy in &policies {
        if !first {
            println!("---");
        }
        first = false;

        let yaml = policy
            .to_yaml(policy.vendor_kind())
            .ok_or_else(|| anyhow::anyhow!("policy '{}' did not render to its own vendor kind", policy.name))?;
        println!("{yaml}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kind_accepts_network_and_system() {
        assert_eq!(parse_kind("network").unwrap(), PolicyKind::Network);
        assert_eq!(parse_kind("system").unwrap(), PolicyKind::System);
    }

    #[test]
    fn parse_kind_rejects_unknown() {
        assert!(parse_kind("bogus").is_err());
    }
}
