// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of goauto

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Commands,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Instrument matching Go processes until interrupted.
    Run(RunArgs),
    /// Print the resolved configuration and exit.
    Config,
}

#[derive(Args, Debug)]
pub(crate) struct RunArgs {
    /// Substring of the target executable path.
    #[arg(long, env = "OTEL_GO_AUTO_TARGET_EXE")]
    pub(crate) target_exe: Option<String>,

    /// Service name reported with every span.
    #[arg(long, env = "OTEL_SERVICE_NAME")]
    pub(crate) service_name: Option<String>,

    /// OTLP/gRPC collector endpoint.
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub(crate) endpoint: Option<String>,

    /// Log finished spans instead of exporting them.
    #[arg(long)]
    pub(crate) stdout_spans: bool,
}
