//! Minimal NDJSON sink for watching devicewatcher notifications by hand:
//! listens on a TCP port and prints one line per received event.

use std::io::{BufRead, BufReader};
use std::net::TcpListener;
use std::process::ExitCode;
use std::thread;

fn main() -> ExitCode {
    let mut port = 9009u16;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--port" => {
                let value = args.next().unwrap_or_default();
                match value.parse::<u16>() {
                    Ok(parsed) if parsed != 0 => port = parsed,
                    _ => {
                        eprintln!("--port requires a valid port number");
                        return ExitCode::from(2);
                    }
                }
            }
            "--help" | "-h" => {
                println!("Usage: notify_sink [--port PORT]");
                println!("Prints every NDJSON line pushed by devicewatcher.");
                return ExitCode::SUCCESS;
            }
            other => {
                eprintln!("Unknown argument: {other}");
                return ExitCode::from(2);
            }
        }
    }

    let listener = match TcpListener::bind(("127.0.0.1", port)) {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("cannot listen on 127.0.0.1:{port}: {err}");
            return ExitCode::FAILURE;
        }
    };
    println!("listening on 127.0.0.1:{port} ...");

    for stream in listener.incoming() {
        let Ok(stream) = stream else {
            continue;
        };
        if let Ok(peer) = stream.peer_addr() {
            println!("accepted from {peer}");
        }
        thread::spawn(move || {
            let reader = BufReader::new(stream);
            for line in reader.lines() {
                let Ok(line) = line else {
                    break;
                };
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    println!("event: {trimmed}");
                }
            }
        });
    }
    ExitCode::SUCCESS
}
