use std::io::{BufRead, Write};
use std::sync::mpsc;

use clap::Parser;
use tracing::Level;
use tracing_subscriber::util::SubscriberInitExt;
use ws_conn::ClientBuilder;

/// interactive websocket echo client
#[derive(Parser)]
struct Args {
    /// ws:// or wss:// uri to connect to
    uri: String,
}

fn main() -> Result<(), ws_conn::WsError> {
    tracing_subscriber::fmt::fmt()
        .with_max_level(Level::DEBUG)
        .finish()
        .try_init()
        .expect("failed to init log");
    let args = Args::parse();

    let (done_tx, done_rx) = mpsc::channel();
    let client = ClientBuilder::new()
        .uri(&args.uri)?
        .on_connected(|_| println!("[OPEN]"))
        .on_received_text(|_, text| println!("[RECV] {text}"))
        .on_received_binary(|_, data| println!("[RECV] {} bytes", data.len()))
        .on_disconnected(move |err| {
            match err {
                Some(err) => println!("[CLOSE] {err}"),
                None => println!("[CLOSE]"),
            }
            let _ = done_tx.send(());
        })
        .connect()?;

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.expect("failed to read stdin");
        if line.is_empty() {
            continue;
        }
        print!("[SEND] > ");
        std::io::stdout().flush().expect("failed to flush stdout");
        println!("{line}");
        if client.send_text(&line).is_err() {
            break;
        }
    }
    client.disconnect();
    let _ = done_rx.recv();
    Ok(())
}
