// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of goauto

use goauto::{Config, Manager, initialize_goauto};
use log::info;
use tokio::select;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::broadcast;

use crate::args::{Commands, RunArgs};

impl Commands {
    pub(crate) fn execute(&self) -> anyhow::Result<()> {
        let config = Config::from_env()?;

        match self {
            Commands::Run(args) => execute_run(args, config),
            Commands::Config => {
                println!("{config:#?}");
                Ok(())
            }
        }
    }
}

fn execute_run(args: &RunArgs, mut config: Config) -> anyhow::Result<()> {
    if let Some(exe) = &args.target_exe {
        config.target_exe = Some(exe.clone());
    }
    if let Some(name) = &args.service_name {
        config.service_name = Some(name.clone());
    }
    if let Some(endpoint) = &args.endpoint {
        config.otlp_endpoint = Some(endpoint.clone());
    }
    if args.stdout_spans {
        config.stdout_sink = true;
    }

    env_logger::Builder::new()
        .filter_level(config.log_level.as_filter())
        .parse_default_env()
        .init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async {
            initialize_goauto(&config)?;

            // Any error before the first probe attaches is fatal; after
            // startup, per-probe failures only log.
            let mut manager = Manager::new(config)?;

            let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
            tokio::spawn(async move {
                let mut sigint =
                    signal(SignalKind::interrupt()).expect("SIGINT handler installs");
                let mut sigterm =
                    signal(SignalKind::terminate()).expect("SIGTERM handler installs");
                select! {
                    _ = sigint.recv() => info!("SIGINT received"),
                    _ = sigterm.recv() => info!("SIGTERM received"),
                }
                let _ = shutdown_tx.send(());
            });

            manager.run(shutdown_rx).await?;
            info!(
                "shutdown complete ({} spans dropped)",
                manager.dropped_spans()
            );
            Ok(())
        })
}
