//! Headless host for the Watson voice pipeline.
//!
//! Loads the TOML config, initializes tracing, wires the HTTP collaborators,
//! and runs the pipeline until ctrl-c. The realtime voice transport is bound
//! by the embedding host; this binary runs with a null transport so the
//! pipeline, gateway, and queue subsystems can be exercised headless.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use watson::gateway::HttpChatGateway;
use watson::stt::HttpStt;
use watson::transport::{TransportMessage, VoiceTransport};
use watson::tts::HttpTts;
use watson::{PipelineDeps, VoicePipeline, WatsonConfig};

/// Transport stand-in: discards audio, reports no history.
struct NullTransport;

#[async_trait]
impl VoiceTransport for NullTransport {
    async fn play(&self, _audio: Bytes) -> watson::Result<()> {
        Ok(())
    }

    async fn stop(&self) -> watson::Result<()> {
        Ok(())
    }

    async fn recent_messages(
        &self,
        _channel_id: &str,
        _limit: usize,
    ) -> watson::Result<Vec<TransportMessage>> {
        Ok(Vec::new())
    }

    async fn create_thread(&self, _forum_id: &str, name: &str, _body: &str) -> watson::Result<String> {
        Err(watson::VoiceError::Transport(format!(
            "no transport bound, cannot create thread {name}"
        )))
    }
}

fn config_path() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" || arg == "-c" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_dir = watson::config::default_data_dir().join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let file_appender = tracing_appender::rolling::daily(&log_dir, "watson.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(file_writer.and(std::io::stderr))
        .init();

    let config = match config_path() {
        Some(path) => WatsonConfig::load(&path)?,
        None => WatsonConfig::default(),
    };
    info!("starting watson host (bot name: {})", config.bot_name.0);

    let deps = PipelineDeps {
        gateway: Arc::new(HttpChatGateway::new(config.gateway.clone())?),
        stt: Arc::new(HttpStt::new(config.stt.clone())?),
        tts: Arc::new(HttpTts::new(config.tts.clone())?),
        transport: Arc::new(NullTransport),
    };

    let pipeline = VoicePipeline::new(config, deps)?;
    let handle = pipeline.handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            handle.stop();
        }
    });

    pipeline.run().await?;
    Ok(())
}
