use clap::Parser;
use client::Client;
use log::{info, warn};
use shared::{Frame, FrameFormat, Packet};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8888")]
    server: String,

    /// Name to introduce yourself with
    #[arg(short = 'n', long, default_value = "guest")]
    name: String,

    /// Password expected by the server, if any
    #[arg(short = 'p', long)]
    password: Option<String>,

    /// Use timestamped framing (must match the server)
    #[arg(long)]
    timestamps: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let format = if args.timestamps {
        FrameFormat::Timestamped
    } else {
        FrameFormat::Plain
    };

    info!("Connecting to: {}", args.server);
    let mut client = Client::connect(&args.server, format).await?;
    let id = client.hello(&args.name, args.password.as_deref()).await?;
    println!("Joined as {} (session {}). Type /quit to leave.", args.name, id);

    let (mut sender, mut incoming) = client.start();

    // Print everything the server sends until it hangs up
    let printer = tokio::spawn(async move {
        while let Some(frame) = incoming.recv().await {
            print_frame(&frame);
        }
        println!("Disconnected.");
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "/quit" {
                    break;
                }
                if let Err(e) = sender.send(&Packet::Text(line.to_string())).await {
                    warn!("Send error: {}", e);
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Received Ctrl+C, shutting down gracefully...");
                break;
            }
        }
    }

    sender.close().await;
    printer.abort();
    Ok(())
}

fn print_frame(frame: &Frame) {
    match Packet::decode(&frame.payload) {
        Ok(Packet::Chat { from, room, text }) => println!("[{}] {}: {}", room, from, text),
        Ok(Packet::Notice(text)) => println!("* {}", text),
        Ok(Packet::Text(text)) => println!("{}", text),
        Ok(other) => println!("{:?}", other),
        Err(_) => println!("<{} bytes>", frame.payload.len()),
    }
}
