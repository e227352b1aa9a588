//! CLI environment subcommands.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use console::style;
use serde_json::{Map, Value};

use super::print_json;
use crate::state::AppState;

#[derive(Subcommand)]
pub enum EnvCommand {
    /// Store a named environment from a YAML or JSON file of variables.
    Create {
        /// Environment name.
        name: String,

        /// File holding a mapping of variables.
        file: PathBuf,

        /// Short description.
        #[arg(long)]
        description: Option<String>,
    },

    /// Show a stored environment.
    Get {
        /// Environment name.
        name: String,
    },
}

pub async fn handle_env_command(cmd: EnvCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        EnvCommand::Create {
            name,
            file,
            description,
        } => {
            let variables = load_variables(&file).await?;
            let env = state
                .engine
                .create_environment(&name, variables, description)
                .await?;

            if json {
                return print_json(&env);
            }
            println!();
            println!(
                "  {} Saved environment '{}' ({} variables)",
                style("*").green().bold(),
                style(&env.name).cyan(),
                env.variables.len()
            );
            println!();
            Ok(())
        }
        EnvCommand::Get { name } => {
            let env = state.engine.get_environment(&name).await?;

            if json {
                return print_json(&env);
            }
            println!();
            println!("  {}", style(&env.name).cyan().bold());
            if let Some(description) = &env.description {
                println!("  {}", style(description).dim());
            }
            println!();
            println!(
                "{}",
                serde_json::to_string_pretty(&Value::Object(env.variables))?
            );
            println!();
            Ok(())
        }
    }
}

/// Read a variables file. JSON is accepted as a subset of YAML.
async fn load_variables(path: &Path) -> Result<Map<String, Value>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_variables(&content).with_context(|| format!("Invalid environment file {}", path.display()))
}

fn parse_variables(content: &str) -> Result<Map<String, Value>> {
    if content.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_yaml_ng::from_str::<Value>(content)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        _ => bail!("environment variables must be a mapping"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_variables_accepts_yaml_and_json() {
        let yaml = parse_variables("region: eu-x\nreplicas: 3\n").unwrap();
        assert_eq!(Value::Object(yaml), json!({"region": "eu-x", "replicas": 3}));

        let from_json = parse_variables(r#"{"region": "us-y"}"#).unwrap();
        assert_eq!(from_json.get("region"), Some(&json!("us-y")));

        assert!(parse_variables("").unwrap().is_empty());
        assert!(parse_variables("- a\n- b\n").is_err());
    }

    #[tokio::test]
    async fn test_load_variables_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_variables(&dir.path().join("absent.yaml"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read"));
    }
}
