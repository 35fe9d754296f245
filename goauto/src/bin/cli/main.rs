// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of goauto

use clap::Parser as _;

mod args;
mod run;

fn main() -> anyhow::Result<()> {
    let cli = crate::args::Cli::parse();
    cli.command.execute()
}
