use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};

use ondemand_deployer::{config::OrchestratorConfig, server, telemetry, template};

#[derive(Debug, Parser)]
#[command(
    name = "ondemand-deployer",
    version,
    about = "Chat-driven on-demand application deployment orchestrator.",
    long_about = "Serves an OpenAI-compatible chat endpoint that deploys applications from a \
source repository into a local kind cluster, a single EC2-hosted k3s cluster, or EKS with \
registry, ingress, DNS and TLS. Redeploys never re-run infrastructure apply; use decommission \
to reclaim cloud resources."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the chat API server (the default).
    Serve,
    /// Deploy to the local ephemeral cluster through a running server.
    DeployLocal(DeployLocalArgs),
    /// Deploy to the managed cloud cluster through a running server.
    DeployCloudHosted(DeployCloudHostedArgs),
}

#[derive(Debug, Args)]
struct CommonDeployArgs {
    /// Deployment name; generated from the repository when omitted.
    #[arg(long)]
    app_name: Option<String>,

    /// Source repository to clone and build.
    #[arg(long)]
    repo_url: String,

    /// Target namespace for the application.
    #[arg(long, default_value = "default")]
    namespace: String,

    /// Desired replica count.
    #[arg(long, default_value_t = 1)]
    replicas: u32,

    /// Base URL of a running orchestrator.
    #[arg(long, default_value = "http://127.0.0.1:8080", env = "ONDEMAND_SERVER")]
    server: String,
}

#[derive(Debug, Args)]
struct DeployLocalArgs {
    #[command(flatten)]
    common: CommonDeployArgs,
}

#[derive(Debug, Args)]
struct DeployCloudHostedArgs {
    #[command(flatten)]
    common: CommonDeployArgs,

    /// Subdomain label for the application URL (requires --hosted-zone-id).
    #[arg(long)]
    subdomain: Option<String>,

    /// Route53 hosted zone the subdomain lives in.
    #[arg(long)]
    hosted_zone_id: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match OrchestratorConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };
    if !config.config_warnings.is_empty() {
        eprintln!("configuration warnings:");
        for warning in &config.config_warnings {
            eprintln!("- {warning}");
        }
    }
    if let Err(err) = telemetry::init(&config.log_level) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
    if let Err(err) = template::verify_catalog() {
        eprintln!("template catalog error: {err}");
        std::process::exit(1);
    }

    let code = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => match server::serve(config).await {
            Ok(()) => 0,
            Err(err) => {
                eprintln!("error: {err}");
                1
            }
        },
        Command::DeployLocal(args) => {
            let body = deploy_body("local", &args.common, None, None);
            run_client(&args.common.server, body).await
        }
        Command::DeployCloudHosted(args) => {
            let body = deploy_body(
                "cloud-hosted",
                &args.common,
                args.subdomain.as_deref(),
                args.hosted_zone_id.as_deref(),
            );
            run_client(&args.common.server, body).await
        }
    };
    std::process::exit(code);
}

fn deploy_body(
    mode: &str,
    common: &CommonDeployArgs,
    subdomain: Option<&str>,
    hosted_zone_id: Option<&str>,
) -> Value {
    let mut body = json!({
        "model": server::MODEL_ID,
        "stream": false,
        "action": "deploy",
        "deployment_mode": mode,
        "github_repo_url": common.repo_url,
        "target_namespace": common.namespace,
        "replicas": common.replicas,
    });
    if let Some(name) = &common.app_name {
        body["instance_name"] = json!(name);
    }
    if let Some(label) = subdomain {
        body["app_subdomain_label"] = json!(label);
    }
    if let Some(zone) = hosted_zone_id {
        body["base_hosted_zone_id"] = json!(zone);
    }
    body
}

/// Post a deployment request and map the outcome onto the documented exit
/// codes: 0 success, 1 validation error, 2 pipeline failure, 3 decommission
/// failure.
async fn run_client(server: &str, body: Value) -> i32 {
    match post_request(server, body).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            2
        }
    }
}

async fn post_request(server: &str, body: Value) -> anyhow::Result<i32> {
    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", server.trim_end_matches('/')))
        .json(&body)
        .send()
        .await?;

    if response.status() == reqwest::StatusCode::BAD_REQUEST {
        let payload: Value = response.json().await.unwrap_or_else(|_| json!({}));
        let message = payload["error"]["message"].as_str().unwrap_or("invalid request");
        eprintln!("request rejected: {message}");
        return Ok(1);
    }
    let payload: Value = response.error_for_status()?.json().await?;
    let content = payload["choices"][0]["message"]["content"]
        .as_str()
        .unwrap_or("{}");
    let outcome: Value = serde_json::from_str(content).unwrap_or_else(|_| json!({}));
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    Ok(match outcome["error"]["kind"].as_str() {
        None => 0,
        Some("ValidationError") => 1,
        Some("DecommissionError") => 3,
        Some(_) => 2,
    })
}
