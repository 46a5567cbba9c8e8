use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// `nexusnode` hosts bot instances in resource-limited sandboxes
#[derive(Debug, Parser)]
#[command(name = "nexusnode", author, about, version)]
pub struct NexusnodeArgs {
    /// The subcommand to run
    #[command(subcommand)]
    pub subcommand: Option<NexusnodeSubcommand>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available subcommands
#[derive(Debug, Parser)]
pub enum NexusnodeSubcommand {
    /// Create the home directory, default configuration and registry database
    #[command(name = "init")]
    Init {
        /// Home directory. Defaults to `$NEXUSNODE_HOME`, then `~/.nexusnode`
        #[arg(long)]
        home: Option<PathBuf>,
    },

    /// Run the management API until interrupted, then stop every sandbox
    #[command(name = "serve")]
    Serve {
        /// Home directory. Defaults to `$NEXUSNODE_HOME`, then `~/.nexusnode`
        #[arg(long)]
        home: Option<PathBuf>,

        /// Address to listen on. Overrides `listen_addr` from the configuration file
        #[arg(long)]
        addr: Option<SocketAddr>,
    },
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
