mod daemon_config;
mod supervisor;

use anyhow::{Context, Result};
use clap::{value_parser, Arg, Command};
use log::{error, info};
use relay_kit::{init_logging, recreate_pipe};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::daemon_config::DaemonConfig;
use crate::supervisor::{ChildLaunch, Supervisor};

fn relay_launch(name: &str, config: &DaemonConfig, relay_config: &Path) -> ChildLaunch {
    ChildLaunch {
        name: name.to_string(),
        program: config.resolve_relay_bin(),
        args: vec![
            OsString::from(relay_config),
            OsString::from(&config.public_to_private_pipe),
            OsString::from(&config.private_to_public_pipe),
        ],
    }
}

async fn wait_for_interrupt() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("interrupt received, stopping relay processes"),
        Err(err) => error!("wait for ctrl-c failed: {}, stopping relay processes", err),
    }
}

async fn async_main(config: DaemonConfig) -> Result<()> {
    recreate_pipe(&config.public_to_private_pipe).with_context(|| {
        format!(
            "recreate pipe {} failed",
            config.public_to_private_pipe.display()
        )
    })?;
    recreate_pipe(&config.private_to_public_pipe).with_context(|| {
        format!(
            "recreate pipe {} failed",
            config.private_to_public_pipe.display()
        )
    })?;

    let launches = [
        relay_launch("public", &config, &config.public_config),
        relay_launch("private", &config, &config.private_config),
    ];
    let mut supervisor = Supervisor::start(&launches, config.poll_interval(), config.grace())
        .context("start relay processes failed")?;
    info!(
        "relay_daemon supervising {} processes, poll every {:?}",
        supervisor.children().len(),
        config.poll_interval()
    );

    supervisor.run_until(wait_for_interrupt()).await;
    info!("relay_daemon stopped");
    Ok(())
}

fn main() {
    let matches = Command::new("relay_daemon")
        .about("Starts the public and private relay bots and watches them")
        .arg(
            Arg::new("config")
                .help("supervisor config file (toml), defaults apply when omitted")
                .value_parser(value_parser!(PathBuf)),
        )
        .get_matches();

    if let Err(err) = init_logging("relay_daemon", true) {
        eprintln!("init logging for relay_daemon failed: {}", err);
    }

    let config_path = matches.get_one::<PathBuf>("config");
    let config = match DaemonConfig::load(config_path.map(PathBuf::as_path)) {
        Ok(config) => config,
        Err(err) => {
            error!("load relay_daemon config failed: {}", err);
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("build tokio runtime failed: {}", err);
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(async_main(config)) {
        error!("relay_daemon exited with error: {:#}", err);
        std::process::exit(1);
    }
}
