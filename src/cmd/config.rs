//! `weave config show|validate`.

use anyhow::Result;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use weave::config::{Config, WEAVE_DIR};
    use weave::weave_config::{CONFIG_FILE, WeaveToml};

    let config_path = project_dir.join(WEAVE_DIR).join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Weave Configuration");
            println!("===================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                WeaveToml::load(&config_path)?
            } else {
                println!("No weave.toml found at {}", config_path.display());
                println!("Using default configuration:");
                WeaveToml::default()
            };
            println!();
            print!("{}", toml::to_string_pretty(&toml)?);
            if toml.routing.is_empty() {
                println!();
                println!("# [routing] not set: built-in table");
                for (label, sections) in toml.routing_table()?.routes() {
                    let names: Vec<&str> = sections.iter().map(|s| s.as_str()).collect();
                    println!("#   {} = {:?}", label, names);
                }
            }
            println!();

            if Config::is_initialized(project_dir) {
                println!("Effective values (with env overrides):");
                let config = Config::new(project_dir.to_path_buf(), false)?;
                println!("  project = \"{}\"", config.project_name());
                println!("  base_branch = \"{}\"", config.base_branch());
                println!("  worktree_base = \"{}\"", config.worktree_base.display());
                println!(
                    "  tracker_token = {}",
                    if config.tracker_token().is_some() {
                        "set"
                    } else {
                        "not set"
                    }
                );
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No weave.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = WeaveToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", console::style(warning).yellow());
                }
            }
            println!();
        }
    }

    Ok(())
}
