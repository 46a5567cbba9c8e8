use clap::{CommandFactory, Parser};
use nexusnode::{
    cli::{init_tracing, NexusnodeArgs, NexusnodeSubcommand},
    config::HostConfig,
    host::NodeHost,
    server::NodeServer,
    NexusResult,
};
use tokio::signal::unix::{signal, SignalKind};

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> NexusResult<()> {
    dotenvy::dotenv().ok();

    let args = NexusnodeArgs::parse();
    match args.subcommand {
        Some(NexusnodeSubcommand::Init { home }) => {
            let _guard = init_tracing(args.verbose, None).await?;
            let home = HostConfig::resolve_home(home);

            tracing::trace!("initializing nexusnode home: home={}", home.display());
            NodeHost::init(&home).await?;
            println!("initialized nexusnode home at {}", home.display());
        }
        Some(NexusnodeSubcommand::Serve { home, addr }) => {
            let home = HostConfig::resolve_home(home);
            let config = HostConfig::load(&home).await?;
            let _guard = init_tracing(args.verbose, Some(&config.log_dir())).await?;

            let addr = addr.unwrap_or(*config.get_listen_addr());
            let host = NodeHost::open(config).await?;
            NodeServer::new(host, addr).serve(shutdown_signal()).await?;
        }
        None => {
            NexusnodeArgs::command().print_help()?;
        }
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM, only Ctrl-C stops the server");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT"),
        _ = sigterm.recv() => tracing::info!("received SIGTERM"),
    }
}
