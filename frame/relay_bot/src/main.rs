mod chat_platform;
mod decision_pipeline;
mod discord_gateway;
mod inbound;
mod reasoning_agent;
mod relay_config;
mod relay_loop;

#[cfg(all(test, unix))]
mod test_relay_loop;

use anyhow::{Context, Result};
use clap::{value_parser, Arg, Command};
use log::{error, info, warn};
use relay_kit::{ensure_pipe, init_logging, ConversationSnapshot, PipeReceiver, PipeSender};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::chat_platform::{ChannelRef, ChatPlatform};
use crate::decision_pipeline::DecisionPipeline;
use crate::discord_gateway::DiscordRestGateway;
use crate::inbound::{run_inbound, InboundHandler, PrivateInbound, PublicInbound};
use crate::reasoning_agent::OpenAIStageAgent;
use crate::relay_config::{RelayConfig, RelayRole};
use crate::relay_loop::{DecisionDispatch, LoopSettings, RelayLoop, TextDispatch};

// upper bound for the pool that pipe opens, reads and writes block on
const MAX_BLOCKING_THREADS: usize = 4;
const INGRESS_QUEUE_SIZE: usize = 64;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

struct RelayArgs {
    config_path: PathBuf,
    public_to_private: PathBuf,
    private_to_public: PathBuf,
}

fn parse_args() -> RelayArgs {
    let matches = Command::new("relay_bot")
        .about("Relays chat snapshots and replies between the public and private bots")
        .arg(
            Arg::new("config")
                .help("relay config file (toml)")
                .required(true)
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("public_to_private")
                .help("named pipe carrying snapshots from the public bot")
                .required(true)
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("private_to_public")
                .help("named pipe carrying replies from the private bot")
                .required(true)
                .value_parser(value_parser!(PathBuf)),
        )
        .get_matches();

    let path_arg = |name: &str| {
        matches
            .get_one::<PathBuf>(name)
            .cloned()
            .unwrap_or_default()
    };
    RelayArgs {
        config_path: path_arg("config"),
        public_to_private: path_arg("public_to_private"),
        private_to_public: path_arg("private_to_public"),
    }
}

/// Resolves the listened channels and hands them to the platform ingress.
async fn start_listening(
    platform: Arc<dyn ChatPlatform>,
    config: &RelayConfig,
    sink: mpsc::Sender<relay_kit::ChatMessage>,
) {
    platform.wait_until_ready().await;
    let retry_interval = config.retry_interval();
    loop {
        let channels = match platform.list_channels().await {
            Ok(channels) => channels,
            Err(err) => {
                warn!("list channels for ingress failed: {:#}", err);
                tokio::time::sleep(retry_interval).await;
                continue;
            }
        };
        let listened: Vec<ChannelRef> = channels
            .into_iter()
            .filter(|channel| {
                config
                    .discord
                    .guild
                    .as_deref()
                    .map_or(true, |guild| channel.guild_name == guild)
            })
            .filter(|channel| config.discord.listen_channels.contains(&channel.channel_name))
            .collect();
        if listened.is_empty() {
            warn!(
                "none of the listen channels {:?} found, retry in {:?}",
                config.discord.listen_channels, retry_interval
            );
            tokio::time::sleep(retry_interval).await;
            continue;
        }

        let labels: Vec<String> = listened.iter().map(ChannelRef::label).collect();
        match platform.start_ingress(listened, sink.clone()).await {
            Ok(()) => {
                info!("listening on {:?}", labels);
                return;
            }
            Err(err) => {
                warn!("start ingress failed: {:#}", err);
                tokio::time::sleep(retry_interval).await;
            }
        }
    }
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).context("install SIGTERM handler failed")?;
        tokio::select! {
            _ = terminate.recv() => info!("SIGTERM received"),
            interrupted = tokio::signal::ctrl_c() => {
                interrupted.context("wait for ctrl-c failed")?;
                info!("interrupt received");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("wait for ctrl-c failed")?;
        info!("interrupt received");
    }
    Ok(())
}

async fn async_main(config: RelayConfig, args: RelayArgs) -> Result<()> {
    ensure_pipe(&args.public_to_private).context("prepare public->private pipe failed")?;
    ensure_pipe(&args.private_to_public).context("prepare private->public pipe failed")?;

    let token = config.discord_token()?;
    let gateway = Arc::new(DiscordRestGateway::new(&config.discord, token)?);
    let platform: Arc<dyn ChatPlatform> = gateway.clone();
    let retry_interval = config.retry_interval();
    let settings = LoopSettings {
        guild: config.discord.guild.clone(),
        output_channel: config.discord.output_channel.clone(),
        retry_interval,
    };
    let (ingress_tx, ingress_rx) = mpsc::channel(INGRESS_QUEUE_SIZE);

    let handler: Arc<dyn InboundHandler> = match config.role {
        RelayRole::Public => {
            let relay = RelayLoop::new(
                platform.clone(),
                PipeReceiver::<String>::new(&args.private_to_public),
                TextDispatch {
                    platform: platform.clone(),
                    message_max_chars: config.relay.message_max_chars,
                },
                settings,
            );
            tokio::spawn(relay.run());

            Arc::new(PublicInbound {
                platform: platform.clone(),
                snapshot_sender: Arc::new(PipeSender::new(&args.public_to_private, retry_interval)),
                history_limit: config.discord.history_limit,
                ignore_authors: config.discord.ignore_authors.clone(),
            })
        }
        RelayRole::Private => {
            let api_key = config.llm_api_key()?;
            let agent = Arc::new(OpenAIStageAgent::new(&config.llm, api_key)?);
            let reply_sender = Arc::new(PipeSender::new(&args.private_to_public, retry_interval));

            let relay = RelayLoop::new(
                platform.clone(),
                PipeReceiver::<ConversationSnapshot>::new(&args.public_to_private),
                DecisionDispatch {
                    pipeline: DecisionPipeline::new(agent),
                    policy: config.escalation_policy(),
                    platform: platform.clone(),
                    reply_sender: reply_sender.clone(),
                    message_max_chars: config.relay.message_max_chars,
                    escalate_on_decode_failure: config.relay.escalate_on_decode_failure,
                },
                settings,
            );
            tokio::spawn(relay.run());

            Arc::new(PrivateInbound {
                platform: platform.clone(),
                reply_sender,
                echo: config.relay.echo_private_messages,
                message_max_chars: config.relay.message_max_chars,
            })
        }
    };
    tokio::spawn(run_inbound(handler, ingress_rx));

    {
        let gateway = gateway.clone();
        tokio::spawn(async move { gateway.login_until_ready(retry_interval).await });
    }
    {
        let platform = platform.clone();
        let config = config.clone();
        tokio::spawn(async move { start_listening(platform, &config, ingress_tx).await });
    }

    info!(
        "relay_bot {} running, pipes {} / {}",
        config.role.as_str(),
        args.public_to_private.display(),
        args.private_to_public.display()
    );
    wait_for_shutdown().await?;
    info!("relay_bot {} shutting down", config.role.as_str());
    Ok(())
}

fn main() {
    let args = parse_args();
    let config = RelayConfig::load(&args.config_path);
    let service_name = config
        .as_ref()
        .map(|config| config.service_name())
        .unwrap_or_else(|_| "relay_bot".to_string());
    if let Err(err) = init_logging(&service_name, true) {
        eprintln!("init logging for {} failed: {}", service_name, err);
    }

    let config = match config {
        Ok(config) => config,
        Err(err) => {
            error!("load config {} failed: {}", args.config_path.display(), err);
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .max_blocking_threads(MAX_BLOCKING_THREADS)
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("build tokio runtime failed: {}", err);
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(async_main(config, args));
    // pipe workers may still sit in a blocking open
    runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
    if let Err(err) = result {
        error!("relay_bot exited with error: {:#}", err);
        std::process::exit(1);
    }
}
