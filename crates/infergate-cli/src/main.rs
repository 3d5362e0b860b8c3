use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use infergate_cluster::{ClusterServer, INTERNAL_PORT_OFFSET};
use infergate_common::{
    AsrRequest, ChatRequest, EmbeddingRequest, NodeConfig, OutputChunk, StreamChannel,
};

#[derive(Parser)]
#[command(name = "infergate")]
#[command(about = "OpenAI-compatible inference gateway with master/worker clustering", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a master node: public API plus cluster control plane
    Master {
        #[arg(short, long, default_value_t = 8080)]
        port: u16,
        /// Enable bearer authentication with this key
        #[arg(long, default_value = "")]
        api_key: String,
        /// Comma-separated demo models to register
        #[arg(long)]
        models: Option<String>,
    },
    /// Connect to an existing master as a worker
    Worker {
        /// Worker id (default: <hostname>-<hex>)
        #[arg(short = 'n', long)]
        name: Option<String>,
        /// Listen address HOST:PORT for the forward endpoint
        #[arg(short = 'l', long)]
        listen: Option<String>,
        /// Master host
        #[arg(default_value = "127.0.0.1")]
        master_host: String,
        /// Master public port (the internal port is +1000)
        #[arg(default_value_t = 8080)]
        master_port: u16,
    },
    /// Auto-detect: master when the port is free, worker when a sibling
    /// cluster answers, error otherwise
    Serve {
        #[arg(short, long, default_value_t = 8080)]
        port: u16,
        #[arg(short, long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Master {
            port,
            api_key,
            models,
        } => master(port, api_key, models).await,
        Commands::Worker {
            name,
            listen,
            master_host,
            master_port,
        } => worker(name, listen, master_host, master_port).await,
        Commands::Serve { port, config } => serve(port, config).await,
    }
}

async fn master(port: u16, api_key: String, models: Option<String>) -> Result<()> {
    let mut config = NodeConfig::default();
    config.gateway.api_key = api_key;

    let node = ClusterServer::new(config);
    let names = split_models(models.as_deref());
    register_demo_models(&node, &names);

    node.run_as_master(port).await?;
    info!(port, models = ?node.list_models(), "master up");
    node.wait().await;
    Ok(())
}

async fn worker(
    name: Option<String>,
    listen: Option<String>,
    master_host: String,
    master_port: u16,
) -> Result<()> {
    let mut config = NodeConfig::default();
    let worker_name = name.unwrap_or_else(|| "worker".to_string());
    config.cluster.worker_id = worker_name.clone();

    let node = ClusterServer::new(config);
    if let Some(listen) = listen {
        let (host, port) = parse_listen(&listen)?;
        node.set_worker_listen_address(&host, port);
    }

    // The worker's own demo model, named after it.
    let model_name = format!("{worker_name}-model");
    let reply = format!("Hello from {worker_name}!");
    node.register_chat(
        &model_name,
        move |req: ChatRequest, out: Arc<StreamChannel>| {
            let reply = reply.clone();
            async move {
                if req.stream {
                    for word in reply.split_inclusive(' ') {
                        if !out.is_writable() {
                            break;
                        }
                        out.push(OutputChunk::text_delta(word, &req.model));
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
                out.push(OutputChunk::final_text(reply, &req.model));
                out.end();
                Ok(())
            }
        },
    );

    let internal_port = master_port + INTERNAL_PORT_OFFSET;
    info!(master = %format!("{master_host}:{master_port}"), internal_port, "connecting to master");
    node.run_as_worker(&master_host, internal_port).await?;
    node.wait().await;
    info!("disconnected from master");
    Ok(())
}

async fn serve(port: u16, config_path: Option<String>) -> Result<()> {
    let config = match config_path {
        Some(path) => NodeConfig::load_from_file(&path)?,
        None => NodeConfig::default(),
    };

    let node = ClusterServer::new(config);
    register_demo_models(&node, &split_models(None));
    let mode = node.run(port).await?;
    info!(?mode, port, "node up");
    node.wait().await;
    Ok(())
}

fn split_models(models: Option<&str>) -> Vec<String> {
    let raw = models.unwrap_or("gpt-4,gpt-4o,whisper-1,text-embedding-ada-002");
    raw.split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_owned)
        .collect()
}

fn parse_listen(listen: &str) -> Result<(String, u16)> {
    match listen.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_string(), port.parse()?)),
        None => Ok(("0.0.0.0".to_string(), listen.parse()?)),
    }
}

/// Mock handlers keyed off the model name, so the gateway can be driven
/// end to end without real inference engines.
fn register_demo_models(node: &ClusterServer, models: &[String]) {
    for model in models {
        if model.starts_with("whisper") || model.starts_with("sensevoice") {
            node.register_asr(model, |req: AsrRequest, out: Arc<StreamChannel>| async move {
                out.push(OutputChunk::final_text(
                    format!("[Mock {}] Transcription result", req.model),
                    req.model,
                ));
                out.end();
                Ok(())
            });
        } else if model.contains("embedding") {
            node.register_embedding(
                model,
                |req: EmbeddingRequest, out: Arc<StreamChannel>| async move {
                    let vectors = (0..req.inputs.len())
                        .map(|i| (0..1536).map(|j| ((i + j) % 7) as f32 / 7.0).collect())
                        .collect();
                    out.push(OutputChunk::embeddings(vectors, req.model));
                    out.end();
                    Ok(())
                },
            );
        } else {
            node.register_chat(model, |req: ChatRequest, out: Arc<StreamChannel>| async move {
                let reply = format!("[Mock {}] This is a response from {}", req.model, req.model);
                if req.stream {
                    for word in reply.split_inclusive(' ') {
                        if !out.is_writable() {
                            break;
                        }
                        out.push(OutputChunk::text_delta(word, &req.model));
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
                out.push(OutputChunk::final_text(reply, &req.model));
                out.end();
                Ok(())
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_listen_forms() {
        assert_eq!(
            parse_listen("192.168.1.10:28080").unwrap(),
            ("192.168.1.10".to_string(), 28080)
        );
        assert_eq!(parse_listen("28080").unwrap(), ("0.0.0.0".to_string(), 28080));
        assert!(parse_listen("not-a-port").is_err());
    }

    #[test]
    fn default_demo_models() {
        let models = split_models(None);
        assert!(models.contains(&"gpt-4".to_string()));
        assert!(models.contains(&"whisper-1".to_string()));
        let custom = split_models(Some("a, b ,, c"));
        assert_eq!(custom, vec!["a", "b", "c"]);
    }
}
