mod admin;
mod server;

use std::process;

use chrono::Utc;
use clap::{Args as ClapArgs, Parser, Subcommand};
use flagplane_lib::{
    evaluate, parse_flag_input, ConfigSnapshot, EvaluationContext, FeatureFlag, FlagError,
};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use admin::RemoteArgs;

#[derive(Parser, Debug)]
#[command(name = "Flagplane")]
#[command(version)]
#[command(about = "Feature flag control plane with versioned publish and rollback", long_about = None)]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(ClapArgs, Debug)]
struct Remote {
    /// Control plane base URL (e.g. http://localhost:8080)
    #[arg(short = 'r', long = "remote", env = "FP_URL")]
    remote: Option<String>,

    /// Tenant that owns the flag
    #[arg(long = "tenant", env = "FP_TENANT")]
    tenant: Option<String>,

    /// Bearer token used for the API call
    #[arg(long = "token", env = "FP_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Path to config file
    #[arg(short = 'c', long = "config", default_value = "flagplane.toml")]
    config: String,
}

impl From<Remote> for RemoteArgs {
    fn from(r: Remote) -> Self {
        RemoteArgs {
            remote: r.remote,
            tenant: r.tenant,
            token: r.token,
            config: r.config,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the control plane HTTP server
    Serve {
        /// Port to listen on
        #[arg(short = 'p', long = "port")]
        port: Option<u16>,

        /// Address to bind
        #[arg(long = "hostname")]
        hostname: Option<String>,

        /// Path to config file
        #[arg(short = 'c', long = "config", default_value = "flagplane.toml")]
        config: String,
    },
    /// Check a flag definition file and print every violation
    Validate {
        /// JSON file holding one flag or an array of flags
        file: String,
    },
    /// Evaluate a flag locally against a context
    Eval {
        /// JSON file holding a config snapshot, a flag, or an array of flags
        #[arg(short = 'f', long = "file")]
        file: String,

        /// Flag key to evaluate
        flag_key: String,

        /// Context key=value pairs (e.g. key=user-1 country=US plan=premium)
        context: Vec<String>,
    },
    /// Publish the current state of a flag as a new version
    Publish {
        flag_key: String,

        /// Replays the first response when the same key is sent again
        #[arg(long = "idempotency-key")]
        idempotency_key: Option<String>,

        #[command(flatten)]
        remote: Remote,
    },
    /// Restore the content of an earlier version as a new version
    Rollback {
        flag_key: String,

        /// Version whose content is restored
        #[arg(short = 't', long = "to")]
        target_version: u64,

        #[arg(long = "idempotency-key")]
        idempotency_key: Option<String>,

        #[command(flatten)]
        remote: Remote,
    },
    /// List the published versions of a flag
    History {
        flag_key: String,

        #[command(flatten)]
        remote: Remote,
    },
}

fn read_json(path: &str) -> Value {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => {
            eprintln!("{} does not exist", path);
            process::exit(1);
        }
    };
    match serde_json::from_str(&content) {
        Ok(value) => value,
        Err(e) => {
            eprintln!("{} is not valid JSON: {}", path, e);
            process::exit(1);
        }
    }
}

fn as_list(raw: Value) -> Vec<Value> {
    match raw {
        Value::Array(items) => items,
        other => vec![other],
    }
}

fn run_validate(path: &str) {
    let mut failures = 0;
    for (i, raw) in as_list(read_json(path)).iter().enumerate() {
        let label = raw
            .get("key")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| format!("#{}", i));
        match parse_flag_input(raw) {
            Ok(_) => println!("✓ {}", label),
            Err(FlagError::Validation(issues)) => {
                failures += 1;
                println!("✗ {}", label);
                for issue in issues {
                    println!("    {}", issue);
                }
            }
            Err(e) => {
                failures += 1;
                println!("✗ {}: {}", label, e);
            }
        }
    }
    if failures > 0 {
        eprintln!("{} invalid flag(s)", failures);
        process::exit(1);
    }
}

/// Finds `flag_key` in a snapshot, a stored flag, or raw flag content.
fn find_flag(raw: Value, flag_key: &str) -> Result<FeatureFlag, String> {
    if raw.get("flags").is_some() {
        let snapshot: ConfigSnapshot =
            serde_json::from_value(raw).map_err(|e| format!("invalid snapshot: {}", e))?;
        return snapshot
            .flag(flag_key)
            .cloned()
            .ok_or_else(|| format!("Flag '{}' not found", flag_key));
    }

    let candidate = as_list(raw)
        .into_iter()
        .find(|f| f.get("key").and_then(Value::as_str) == Some(flag_key))
        .ok_or_else(|| format!("Flag '{}' not found", flag_key))?;

    if let Ok(flag) = serde_json::from_value::<FeatureFlag>(candidate.clone()) {
        return Ok(flag);
    }
    let input = parse_flag_input(&candidate).map_err(|e| e.to_string())?;
    Ok(FeatureFlag::from_input(input, 1, Utc::now()))
}

/// `key` and `userId` set the identity; every other pair becomes an
/// attribute. Values that parse as JSON keep their type.
fn parse_context(pairs: &[String]) -> EvaluationContext {
    let mut context = EvaluationContext::new();
    for pair in pairs {
        let Some((name, raw)) = pair.split_once('=') else {
            continue;
        };
        match name {
            "key" => context.key = Some(raw.to_string()),
            "userId" => context.user_id = Some(raw.to_string()),
            _ => {
                let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::from(raw));
                context.attributes.insert(name.to_string(), value);
            }
        }
    }
    context
}

fn run_eval(path: &str, flag_key: &str, context_args: &[String]) {
    let flag = match find_flag(read_json(path), flag_key) {
        Ok(flag) => flag,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };
    let result = evaluate(&flag, &parse_context(context_args));
    match serde_json::to_string_pretty(&result) {
        Ok(out) => println!("{}", out),
        Err(e) => {
            eprintln!("Failed to encode result: {}", e);
            process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Args::parse();
    match cli.cmd {
        Command::Serve {
            port,
            hostname,
            config,
        } => server::run_serve(port, hostname, &config).await,
        Command::Validate { file } => run_validate(&file),
        Command::Eval {
            file,
            flag_key,
            context,
        } => run_eval(&file, &flag_key, &context),
        Command::Publish {
            flag_key,
            idempotency_key,
            remote,
        } => admin::run_publish(&flag_key, idempotency_key.as_deref(), &remote.into()).await,
        Command::Rollback {
            flag_key,
            target_version,
            idempotency_key,
            remote,
        } => {
            admin::run_rollback(
                &flag_key,
                target_version,
                idempotency_key.as_deref(),
                &remote.into(),
            )
            .await
        }
        Command::History { flag_key, remote } => {
            admin::run_history(&flag_key, &remote.into()).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flagplane_lib::EvaluationReason;
    use serde_json::json;

    fn checkout() -> Value {
        json!({
            "tenantId": "acme",
            "key": "checkout",
            "name": "Checkout",
            "enabled": true,
            "variants": {"on": true, "off": false},
            "fallthroughVariant": "off",
            "rules": [{
                "id": "us-users",
                "name": "US users",
                "conditions": [{"attribute": "country", "operator": "eq", "value": "US"}],
                "variant": "on"
            }]
        })
    }

    #[test]
    fn test_parse_context_types() {
        let context = parse_context(&[
            "key=user-1".to_string(),
            "country=US".to_string(),
            "age=42".to_string(),
            "beta=true".to_string(),
            "broken".to_string(),
        ]);
        assert_eq!(context.key.as_deref(), Some("user-1"));
        assert_eq!(context.attributes["country"], json!("US"));
        assert_eq!(context.attributes["age"], json!(42));
        assert_eq!(context.attributes["beta"], json!(true));
        assert_eq!(context.attributes.len(), 3);
    }

    #[test]
    fn test_eval_raw_flag_content() {
        let flag = find_flag(checkout(), "checkout").unwrap();
        assert_eq!(flag.version, 1);

        let us = evaluate(&flag, &parse_context(&["country=US".to_string()]));
        assert_eq!(us.variant_key, "on");
        assert_eq!(us.reason, EvaluationReason::RuleMatch);

        let ca = evaluate(&flag, &parse_context(&["country=CA".to_string()]));
        assert_eq!(ca.variant_key, "off");
        assert_eq!(ca.reason, EvaluationReason::Fallthrough);
    }

    #[test]
    fn test_eval_finds_flag_in_array() {
        let mut other = checkout();
        other["key"] = json!("search");
        let flag = find_flag(json!([other, checkout()]), "checkout").unwrap();
        assert_eq!(flag.key, "checkout");
        assert!(find_flag(json!([checkout()]), "missing").is_err());
    }

    #[test]
    fn test_eval_snapshot() {
        let stored = FeatureFlag::from_input(
            serde_json::from_value(checkout()).unwrap(),
            4,
            Utc::now(),
        );
        let snapshot = ConfigSnapshot {
            tenant_id: "acme".into(),
            environment: "default".into(),
            generated_at: Utc::now(),
            flags: vec![stored],
        };
        let raw = serde_json::to_value(&snapshot).unwrap();
        let flag = find_flag(raw, "checkout").unwrap();
        assert_eq!(flag.version, 4);
    }

    #[test]
    fn test_invalid_content_reports_issues() {
        let mut bad = checkout();
        bad["fallthroughVariant"] = json!("missing");
        let err = find_flag(bad, "checkout").unwrap_err();
        assert!(err.contains("fallthroughVariant"));
    }

    #[test]
    fn test_cli_parses_rollback() {
        let args = Args::parse_from([
            "fp", "rollback", "checkout", "--to", "2", "--tenant", "acme", "--token", "t",
        ]);
        match args.cmd {
            Command::Rollback {
                flag_key,
                target_version,
                remote,
                ..
            } => {
                assert_eq!(flag_key, "checkout");
                assert_eq!(target_version, 2);
                assert_eq!(remote.config, "flagplane.toml");
                assert_eq!(remote.tenant.as_deref(), Some("acme"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
