use clap::{Parser, ValueEnum};
use log::info;
use server::apps::{Chat, Echo};
use server::{Config, Game, Instance, Listener, MalformedFramePolicy};
use shared::FrameFormat;
use std::time::Duration;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum App {
    Echo,
    Chat,
}

/// Main-method of the application.
/// Parses command-line arguments, then serves the chosen application until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Command line arguments
    #[derive(Parser, Debug)]
    #[command(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[arg(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[arg(short, long, default_value = "8888")]
        port: u16,
        /// Tick rate (updates per second)
        #[arg(short, long, default_value = "20")]
        tick_rate: u32,
        /// Maximum number of concurrent sessions
        #[arg(short, long, default_value = "64")]
        max_sessions: usize,
        /// Seconds a session may stay silent before it is dropped
        #[arg(long, default_value = "15")]
        read_timeout: u64,
        /// Seconds an outbound write may take before the session is dropped
        #[arg(long, default_value = "15")]
        write_timeout: u64,
        /// Prefix every frame with an 8-byte send timestamp
        #[arg(long)]
        timestamps: bool,
        /// Skip oversized frames instead of closing the session
        #[arg(long)]
        skip_malformed: bool,
        /// Application to serve
        #[arg(short, long, value_enum, default_value = "echo")]
        app: App,
        /// Password clients must present in their hello
        #[arg(long)]
        password: Option<String>,
    }

    // Parse command line arguments
    let args = Args::parse();

    let config = Config::default()
        .with_tick_rate(args.tick_rate)
        .with_max_sessions(args.max_sessions)
        .with_read_timeout(Duration::from_secs(args.read_timeout))
        .with_write_timeout(Duration::from_secs(args.write_timeout))
        .with_frame_format(if args.timestamps {
            FrameFormat::Timestamped
        } else {
            FrameFormat::Plain
        })
        .with_malformed_frames(if args.skip_malformed {
            MalformedFramePolicy::Skip
        } else {
            MalformedFramePolicy::Terminate
        });

    let address = format!("{}:{}", args.host, args.port);
    info!("Starting {:?} server on {}", args.app, address);

    match args.app {
        App::Echo => {
            let echo = match args.password {
                Some(password) => Echo::new(Some(password)),
                None => Echo::default(),
            };
            serve(echo, config, &address).await?
        }
        App::Chat => serve(Chat::new(args.password), config, &address).await?,
    }

    info!("Server shut down");
    Ok(())
}

async fn serve<G: Game>(game: G, config: Config, address: &str) -> server::Result<()> {
    let instance = Instance::new(game, config);
    let listener = Listener::bind(address, instance).await?;
    listener.run().await
}
