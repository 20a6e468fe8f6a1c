use aml_lookup::{load_config, setup_logging, Cli, CliRunner};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    setup_logging(args.verbose)?;

    info!("Starting aml-lookup v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args)?;
    info!("Configuration loaded successfully");
    info!("Browser pool capacity: {}", config.pool.capacity);
    info!("Fetch strategies: {:?}", config.fetch.strategies);

    let runner = CliRunner::new(config, &args);

    let cancel = CancellationToken::new();
    let _shutdown_handler = setup_shutdown_handler(cancel.clone());

    let result = runner.run(args.command, cancel).await;

    if let Err(e) = result {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }

    info!("aml-lookup stopped");
    Ok(())
}

fn setup_shutdown_handler(cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    error!("Failed to create SIGTERM handler: {}", e);
                    return;
                }
            };
            tokio::select! {
                _ = signal::ctrl_c() => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            if signal::ctrl_c().await.is_ok() {
                info!("Received SIGINT");
            }
        }

        cancel.cancel();
    })
}
