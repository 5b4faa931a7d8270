use std::io::{self, BufRead};
use std::path::PathBuf;
use std::process::exit;
use std::thread;
use std::time::Duration;

use clap::Parser;
use log::error;

use kvs::{parse_client_line, ClientCommand, KvsClient, Notification, Result};

/// Interactive client: subscribe to keys and print their change events.
#[derive(Parser)]
#[command(name = "kvs-client", version, about = "A key-value store client")]
struct Cli {
    /// Unique id used to derive this client's pipe names under /tmp
    client_id: String,

    /// Path of the server's registration FIFO
    register_pipe_path: PathBuf,
}

fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .target(env_logger::Target::Stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        error!("{}", e);
        exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut client = KvsClient::connect(&cli.client_id, &cli.register_pipe_path)?;
    println!("Connected to server");

    let notifications = client
        .take_notifications()
        .expect("fresh client owns its notification pipe");
    let printer = thread::spawn(move || {
        for event in notifications {
            match event {
                Ok(Notification::Write { key, value }) => println!("({key},{value})"),
                Ok(Notification::Delete { key }) => println!("({key},DELETED)"),
                Err(e) => {
                    error!("notification stream: {}", e);
                    break;
                }
            }
        }
    });

    for line in io::stdin().lock().lines() {
        let line = line?;
        match parse_client_line(&line) {
            ClientCommand::Subscribe(key) => {
                if client.subscribe(&key)? {
                    println!("Subscribed to {key}");
                } else {
                    eprintln!("Subscription to {key} denied");
                }
            }
            ClientCommand::Unsubscribe(key) => {
                if client.unsubscribe(&key)? {
                    println!("Unsubscribed from {key}");
                } else {
                    eprintln!("Unsubscription from {key} denied");
                }
            }
            ClientCommand::Delay(ms) => {
                if ms > 0 {
                    println!("Waiting...");
                    thread::sleep(Duration::from_millis(ms));
                }
            }
            ClientCommand::Disconnect => break,
            ClientCommand::Invalid => eprintln!("Invalid command. See HELP for usage"),
            ClientCommand::Empty => {}
        }
    }

    client.disconnect()?;
    println!("Disconnected from server");
    let _ = printer.join();
    Ok(())
}
