use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use botpanel_server::ServerConfig;

#[derive(Parser)]
#[command(name = "botpanel", about = "Host bot scripts and stream their consoles to the browser")]
struct Cli {
    /// Config file (defaults to $XDG_CONFIG_HOME/botpanel/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on, overrides the config file
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Directory holding one folder per bot, overrides the config file
    #[arg(long)]
    bots_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "botpanel=info,libbotpanel=info,botpanel_server=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = ServerConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(bots_dir) = cli.bots_dir {
        config.bots_dir = bots_dir;
    }

    botpanel_server::run(config).await
}
