use anyhow::Result;
use clap::Parser;
use register_server::app::ApplicationBuilder;
use register_server::config::Cli;
use register_server::config::Commands;
use register_server::config::ServerArgs;
use utils::version;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(server_args) => run_server(*server_args).await,
    }
}

async fn run_server(server_args: ServerArgs) -> Result<()> {
    let _guard = utils::logging::init(server_args.log_file.as_deref());
    utils::logging::install_panic_hook();

    tracing::info!("Starting register server {}", &**version::VERSION);

    let app = ApplicationBuilder::new(server_args).build().await?;
    app.run().await?;

    tracing::info!("Register server stopped");
    Ok(())
}
