use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "switchyard")]
#[command(about = "WebRTC signaling relay")]
pub struct Cli {
    /// Listen port; overrides SWITCHYARD_PORT.
    #[arg(long)]
    pub port: Option<u16>,
}
