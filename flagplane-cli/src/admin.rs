use std::process;

use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};

/// Configuration for remote operations (from flagplane.toml [remote] section)
#[derive(Debug, Deserialize, Default, PartialEq)]
pub struct RemoteConfig {
    pub url: Option<String>,
    pub tenant: Option<String>,
    pub token: Option<String>,
}

/// Flags shared by every admin subcommand.
#[derive(Debug, Default)]
pub struct RemoteArgs {
    pub remote: Option<String>,
    pub tenant: Option<String>,
    pub token: Option<String>,
    pub config: String,
}

/// Load remote config from flagplane.toml
pub fn load_remote_config(config_path: &str) -> RemoteConfig {
    std::fs::read_to_string(config_path)
        .ok()
        .and_then(|content| {
            #[derive(Deserialize)]
            struct FpToml {
                remote: Option<RemoteConfig>,
            }
            toml::from_str::<FpToml>(&content).ok()
        })
        .and_then(|c| c.remote)
        .unwrap_or_default()
}

/// CLI arg (or its env var) > flagplane.toml
fn resolve(arg: Option<&str>, configured: Option<&String>) -> Option<String> {
    arg.map(String::from)
        .or_else(|| configured.cloned())
        .filter(|v| !v.trim().is_empty())
}

struct AdminClient {
    http: reqwest::Client,
    base: String,
    token: String,
    tenant: String,
}

impl AdminClient {
    fn from_args(args: &RemoteArgs) -> Self {
        let config = load_remote_config(&args.config);

        let Some(base) = resolve(args.remote.as_deref(), config.url.as_ref()) else {
            eprintln!("No remote URL specified. Use --remote, set FP_URL, or configure [remote] in flagplane.toml");
            process::exit(1);
        };
        let Some(token) = resolve(args.token.as_deref(), config.token.as_ref()) else {
            eprintln!("No token specified. Use --token, set FP_TOKEN, or configure [remote] in flagplane.toml");
            process::exit(1);
        };
        let Some(tenant) = resolve(args.tenant.as_deref(), config.tenant.as_ref()) else {
            eprintln!("No tenant specified. Use --tenant, set FP_TENANT, or configure [remote] in flagplane.toml");
            process::exit(1);
        };

        Self {
            http: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
            token,
            tenant,
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        idempotency_key: Option<&str>,
    ) -> Result<Value, String> {
        let url = format!("{}{}", self.base, path);
        let mut request = self
            .http
            .request(method, &url)
            .bearer_auth(&self.token)
            .header("x-tenant-id", &self.tenant);
        if let Some(key) = idempotency_key {
            request = request.header("idempotency-key", key);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| format!("request to {} failed: {}", url, e))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(format!("{} ({}): {}", url, status, body));
        }
        serde_json::from_str(&body).map_err(|e| format!("unexpected response from {}: {}", url, e))
    }
}

fn fail(message: String) -> ! {
    eprintln!("{}", message);
    process::exit(1);
}

pub async fn run_publish(flag_key: &str, idempotency_key: Option<&str>, args: &RemoteArgs) {
    let client = AdminClient::from_args(args);
    let path = format!("/api/flags/{}/publish", flag_key);
    let response = client
        .send(Method::POST, &path, None, idempotency_key)
        .await
        .unwrap_or_else(|e| fail(format!("Publish failed: {}", e)));

    let version = response["published"]["version"].as_u64().unwrap_or(0);
    println!("✓ Published {} as version {} (tenant: {})", flag_key, version, client.tenant);
}

pub async fn run_rollback(
    flag_key: &str,
    target_version: u64,
    idempotency_key: Option<&str>,
    args: &RemoteArgs,
) {
    let client = AdminClient::from_args(args);
    let path = format!("/api/flags/{}/rollback", flag_key);
    let body = json!({ "targetVersion": target_version });
    let response = client
        .send(Method::POST, &path, Some(body), idempotency_key)
        .await
        .unwrap_or_else(|e| fail(format!("Rollback failed: {}", e)));

    let version = response["rolledBack"]["version"].as_u64().unwrap_or(0);
    println!(
        "✓ Rolled {} back to the content of version {}; live version is now {} (tenant: {})",
        flag_key, target_version, version, client.tenant
    );
}

pub async fn run_history(flag_key: &str, args: &RemoteArgs) {
    let client = AdminClient::from_args(args);
    let path = format!("/api/flags/{}/history", flag_key);
    let response = client
        .send(Method::GET, &path, None, None)
        .await
        .unwrap_or_else(|e| fail(format!("History failed: {}", e)));

    let records = response["history"].as_array().cloned().unwrap_or_default();
    if records.is_empty() {
        println!("No published versions of {}", flag_key);
        return;
    }
    for line in format_history(&records) {
        println!("{}", line);
    }
}

fn format_history(records: &[Value]) -> Vec<String> {
    records
        .iter()
        .map(|record| {
            format!(
                "v{:<5} {:<25} fallthrough={}",
                record["version"].as_u64().unwrap_or(0),
                record["createdAt"].as_str().unwrap_or("-"),
                record["flag"]["fallthroughVariant"].as_str().unwrap_or("-"),
            )
        })
        .collect()
}
