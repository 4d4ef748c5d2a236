use autopol::resolver::KubeClientProvider;

/// Enumerate kubeconfig contexts this host can reach, so an operator
/// knows which `--cluster` values are valid for `discover`/`serve`/`policy`.
pub fn run() -> anyhow::Result<()> {
    let contexts = KubeClientProvider::list_contexts()?;

    if contexts.is_empty() {
        println!("No kubeconfig contexts found.");
        return Ok(());
    }

    println!("Available kubeconfig contexts:\n");
    for context in &contexts {
        println!("  {context}");
    }
    Ok(())
}
