//! Configuration view and validation commands: `fleet-connector config`.

use anyhow::{Context, Result};
use std::path::Path;

use super::super::ConfigCommands;
use fleet_connector::config::FleetConfig;

const EXAMPLE_CONFIG: &str = r#"# Fleet connector configuration
connector_type: simulated
connector_config:
  speed: 0.5
  frame_id: map
update_freq: 2.0
location_tz: UTC
fleet:
  - robot_id: robot-0
  - robot_id: robot-1
watchdog:
  heartbeat_interval_secs: 30
  health_check: true
logging:
  log_level: info
  format: text
"#;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let config = FleetConfig::load(config_path)?;

            println!();
            println!("Fleet Configuration");
            println!("===================");
            println!();
            println!("Config file: {}", config_path.display());
            println!(
                "Robots ({}): {}",
                config.fleet.len(),
                config.robot_ids().join(", ")
            );
            println!(
                "API key: {}",
                if config.api_key.is_some() {
                    "set"
                } else {
                    "not set"
                }
            );
            println!();
            let yaml =
                serde_yaml::to_string(&config).context("Failed to render configuration")?;
            print!("{}", yaml);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let config = FleetConfig::load(config_path)?;
            let warnings = config.warnings();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration is valid, with warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "{} already exists. Use --force to overwrite it.",
                    config_path.display()
                );
            }
            if let Some(parent) = config_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            std::fs::write(config_path, EXAMPLE_CONFIG)
                .with_context(|| format!("Failed to write {}", config_path.display()))?;
            println!("Created {}", config_path.display());
        }
    }

    Ok(())
}
