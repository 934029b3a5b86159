// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::num::NonZeroUsize;
use std::sync::Arc;

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use tokio::runtime;
use tracing_subscriber::EnvFilter;

use mrun::config::RunnerConfig;
use mrun::output::{Console, Sink};
use mrun::procs::Supervisor;
use mrun::signals::OsInterrupts;
use mrun::Error;

const COUNT: &str = "count";
const PROGRAM: &str = "program";
const ARGS: &str = "args";
const NO_TEMPLATE: &str = "no-template";

const LOG_ENV: &str = "MRUN_LOG";

trait SetupClapApp {
    fn setup_clap_app(self) -> Self;
    fn program_args(self) -> Self;
}

impl SetupClapApp for Command {
    fn setup_clap_app(self) -> Self {
        self.version(env!("CARGO_PKG_VERSION"))
            .author(env!("CARGO_PKG_AUTHORS"))
            .about(env!("CARGO_PKG_DESCRIPTION"))
    }

    fn program_args(self) -> Self {
        self.arg(
            Arg::new(COUNT)
                .value_name("N")
                .required(true)
                .value_parser(value_parser!(u64).range(1..))
                .help("number of instances to run"),
        )
        .arg(
            Arg::new(PROGRAM)
                .value_name("PROGRAM")
                .required(true)
                .help("program to execute"),
        )
        .arg(
            Arg::new(ARGS)
                .value_name("ARGS")
                .num_args(0..)
                .trailing_var_arg(true)
                .allow_hyphen_values(true)
                .help("arguments passed to every instance, {instance_id} is replaced by the instance id"),
        )
        .arg(
            Arg::new(NO_TEMPLATE)
                .long(NO_TEMPLATE)
                .action(ArgAction::SetTrue)
                .help("pass arguments verbatim, without replacing {instance_id}"),
        )
    }
}

fn main() {
    let args = Command::new(env!("CARGO_PKG_NAME"))
        .setup_clap_app()
        .program_args()
        .get_matches();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config = match runner_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    };

    let runtime = match runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to initialize Tokio Runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(config)) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn runner_config(args: &ArgMatches) -> Result<RunnerConfig, Error> {
    let count = args
        .get_one::<u64>(COUNT)
        .and_then(|n| usize::try_from(*n).ok())
        .and_then(NonZeroUsize::new)
        .ok_or("invalid number of instances")?;
    let program = args
        .get_one::<String>(PROGRAM)
        .ok_or("program is required")?;
    let program_args = args
        .get_many::<String>(ARGS)
        .map(|values| values.cloned().collect::<Vec<_>>())
        .unwrap_or_default();

    let mut config = RunnerConfig::new(count, program.clone(), program_args);
    config.template = !args.get_flag(NO_TEMPLATE);

    Ok(config)
}

/// Children exit statuses are reported, never propagated
async fn run(config: RunnerConfig) -> Result<(), Error> {
    let sink: Arc<dyn Sink> = Arc::new(Console);

    // subscribe before anything is spawned so no interrupt is lost
    let mut interrupts = OsInterrupts::new()?;

    let mut supervisor = Supervisor::from_config(&config, sink)?;
    supervisor.start().await?;
    supervisor.wait_for_termination(&mut interrupts).await?;

    Ok(())
}
