use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sparsed::cli::Cli;
use sparsed::coordinator::{CoordConfig, CoordServer};
use sparsed::ps::run_param_server;
use sparsed::worker::run_worker;
use sparsed_config::{JobConfig, Role};

fn main() {
    let cli = Cli::parse();
    let config = match cli.into_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {}", err);
            std::process::exit(1);
        }
    };

    init_logging(config.verbose);

    let threads = match config.role {
        Role::Ps => config.ps_thread,
        Role::Wk => 2,
    };
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads.max(1))
        .enable_all()
        .build()
        .expect("tokio runtime");

    if let Err(err) = runtime.block_on(run(&config)) {
        error!("{}", err);
        std::process::exit(1);
    }
}

fn init_logging(verbose: u32) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sparsed={}", default)));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(config: &JobConfig) -> Result<(), Box<dyn std::error::Error>> {
    match config.role {
        Role::Ps => {
            // The first param server process also hosts the
            // coordinator.
            if config.ps_id == 0 {
                let coordinator = std::sync::Arc::new(CoordServer::new(CoordConfig::from_job(config)?));
                let cs = tokio::spawn(async move { coordinator.run().await });
                run_param_server(config).await?;
                cs.await??;
            } else {
                run_param_server(config).await?;
            }
            info!(ps_id = config.ps_id, "param server exits");
        }
        Role::Wk => {
            run_worker(config).await?;
            info!("worker exits");
        }
    }
    Ok(())
}
