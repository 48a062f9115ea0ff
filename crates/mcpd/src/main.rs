use std::process::Stdio;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde_json::json;

mod cli;

use cli::{Cli, Commands};
use mcpd_control::{HostOptions, run_host, send_control_request};
use mcpd_core::RpcConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    let socket_path = cli
        .socket
        .clone()
        .unwrap_or_else(RpcConfig::default_socket_path);

    match cli.command {
        Commands::Serve {
            catalog,
            background,
            foreground,
        } => {
            let catalog_path = catalog.unwrap_or_else(mcpd_config::default_catalog_path);
            if background && !foreground {
                let pid = spawn_background(&catalog_path, cli.socket.as_deref())?;
                println!("mcpd started in background (pid={pid})");
                return Ok(());
            }
            run_host(HostOptions {
                catalog_path,
                socket_override: cli.socket,
            })
            .await
        }
        Commands::Status => {
            match send_control_request(&socket_path, "host/info", json!({})).await {
                Ok(response) => {
                    let version = response["result"]["version"].as_str().unwrap_or("?");
                    let uptime = response["result"]["uptimeSeconds"].as_i64().unwrap_or(0);
                    println!(
                        "mcpd {version} is running at {} (up {uptime}s)",
                        socket_path.display()
                    );
                    let pools =
                        send_control_request(&socket_path, "pool/status", json!({})).await?;
                    if let Some(entries) = pools["result"].as_array() {
                        for pool in entries {
                            println!(
                                "  {} [{}] instances={} suspended={}",
                                pool["server"].as_str().unwrap_or("?"),
                                pool["strategy"].as_str().unwrap_or("?"),
                                pool["instances"].as_array().map(Vec::len).unwrap_or(0),
                                pool["suspended"].as_bool().unwrap_or(false),
                            );
                        }
                    }
                }
                Err(_) => {
                    println!("mcpd is not running at {}", socket_path.display());
                }
            }
            Ok(())
        }
        Commands::Stop => {
            let response = send_control_request(&socket_path, "host/stop", json!({}))
                .await
                .with_context(|| format!("failed to stop mcpd at {}", socket_path.display()))?;
            if response.get("error").is_some() {
                bail!("mcpd returned an error while stopping: {response}");
            }
            println!("mcpd stop signal sent to {}", socket_path.display());
            Ok(())
        }
        Commands::Reload => {
            let response = send_control_request(&socket_path, "config/reload", json!({}))
                .await
                .with_context(|| format!("failed to reach mcpd at {}", socket_path.display()))?;
            if let Some(error) = response.get("error") {
                bail!(
                    "reload failed: {}",
                    error["message"].as_str().unwrap_or("unknown error")
                );
            }
            println!(
                "catalog reloaded: {} servers, {} pools",
                response["result"]["servers"], response["result"]["pools"]
            );
            Ok(())
        }
        Commands::Call {
            name,
            args,
            routing_key,
        } => {
            let arguments: serde_json::Value =
                serde_json::from_str(&args).context("--args must be a JSON object")?;
            let mut params = json!({"name": name, "arguments": arguments});
            if let Some(key) = routing_key {
                params["routingKey"] = json!(key);
            }
            let response = send_control_request(&socket_path, "tools/call", params)
                .await
                .with_context(|| format!("failed to reach mcpd at {}", socket_path.display()))?;
            if let Some(error) = response.get("error") {
                bail!(
                    "call failed ({}): {}",
                    error["code"],
                    error["message"].as_str().unwrap_or("unknown error")
                );
            }
            println!("{}", serde_json::to_string_pretty(&response["result"])?);
            Ok(())
        }
    }
}

fn spawn_background(catalog_path: &std::path::Path, socket: Option<&std::path::Path>) -> Result<u32> {
    let exe = std::env::current_exe().context("failed to resolve current executable")?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("serve")
        .arg("--foreground")
        .arg("--catalog")
        .arg(catalog_path);
    if let Some(socket_path) = socket {
        cmd.arg("--socket").arg(socket_path);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    let child = cmd.spawn().context("failed to spawn background mcpd")?;
    Ok(child.id())
}
