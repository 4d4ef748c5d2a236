use autopol::config::Config;

use crate::cli::ConfigAction;

pub fn run(action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Schema => {
            println!("{}", Config::schema_json()?);
            Ok(())
        }
        ConfigAction::Validate { path } => validate(&path),
    }
}

fn validate(path: &str) -> anyhow::Result<()> {
    match Config::from_file(std::path::Path::new(path)) {
        Ok(config) => {
            println!("OK: {path} is a valid config");
            println!("  network_log_from: {}", config.network_log_from);
            println!("  system_log_from: {}", config.system_log_from);
            println!("  operation_mode: {:?}", config.operation_mode);
            Ok(())
        }
        Err(e) => anyhow::bail!("{path} is not a valid config: {e}"),
    }
}
