use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "a1-mediator")]
#[command(about = "Policy mediator between northbound HTTP clients and message-bus handlers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Check connectivity to the state store and the EI coordinator
    Check,

    /// Run the mediator (HTTP surface + bus loop)
    Serve {
        /// HTTP listen port (overrides A1_HTTP_PORT)
        #[arg(long)]
        port: Option<u16>,
    },
}
