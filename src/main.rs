mod cache;
mod cli;
mod config;
mod feed;
mod layout;
mod poll;
mod server;
mod state;
mod storage;
mod template;

use std::process::ExitCode;

use anyhow::Result;
use cli::Args;
use poll::Poller;
use server::Server;
use state::State;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::Level;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

fn set_up_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_regex(false)
                .with_default_directive(Level::INFO.into())
                .with_env_var("NOTIFEED_LOG")
                .from_env_lossy(),
        )
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    set_up_logging();

    let args = Args::parse();
    let state = match load_state(&args).await {
        Ok(state) => state,

        Err(e) => {
            error!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    if args.check_once {
        return match poll::poll_once(&state.checker).await {
            Some(_) => ExitCode::SUCCESS,
            None => ExitCode::FAILURE,
        };
    }

    let cancel = CancellationToken::new();

    tokio::spawn({
        let cancel = cancel.clone();

        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("could not listen for Ctrl-C: {e}");
            }

            cancel.cancel();
        }
    });

    let mut tasks = match start(state.clone(), cancel.clone()).await {
        Ok(tasks) => tasks,

        Err(e) => {
            error!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    let mut exit_code = ExitCode::SUCCESS;

    while let Some(task_result) = tasks.join_next().await {
        cancel.cancel();

        match task_result {
            Ok(Ok(())) => {}

            Ok(Err(e)) => {
                error!("{e:#}");
                exit_code = ExitCode::FAILURE;
            }

            Err(e) => {
                error!("{e:#}");
                exit_code = ExitCode::FAILURE;
            }
        }
    }

    state.storage.close().await;

    exit_code
}

async fn load_state(args: &Args) -> Result<State> {
    let config_paths = args
        .config_path
        .clone()
        .into_iter()
        .chain(["./notifeed.toml".into(), "/etc/notifeed.toml".into()])
        .collect::<Vec<_>>();
    let mut config = config::load(&config_paths)?;
    config.update(args);

    State::new(config).await
}

async fn start(state: State, cancel: CancellationToken) -> Result<JoinSet<Result<()>>> {
    let poller = Poller::new(
        state.checker.clone(),
        state.cfg.poll_interval.into(),
        state.cfg.max_initial_check_sleep.into(),
        state.wake_up.clone(),
    );
    let server = Server::new(state).await?;

    let mut tasks = JoinSet::new();
    tasks.spawn(poller.run(cancel.clone()));
    tasks.spawn(server.serve(cancel.clone()));

    Ok(tasks)
}
