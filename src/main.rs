//! CINDER - Interactive Shell
//! A thin REPL over the storage engine for manual poking.

use std::io::{self, BufRead, Write};
use std::ops::ControlFlow;
use std::time::Duration;

use cinder::{Cinder, CinderError, Config};

fn main() {
    env_logger::init();

    println!();
    println!("  ╔═══════════════════════════════════════════╗");
    println!("  ║          CINDER Storage Engine            ║");
    println!("  ║    Log-Structured Key-Value Store v0.1    ║");
    println!("  ╚═══════════════════════════════════════════╝");
    println!();
    println!("  Commands:");
    println!("    set <key> <value>      - Store a key-value pair");
    println!("    setex <key> <ms> <val> - Store a pair that expires");
    println!("    get <key>              - Retrieve a value by key");
    println!("    del <key>              - Delete a key");
    println!("    ttl <key>              - Show remaining lifetime");
    println!("    scan [prefix]          - List key-value pairs");
    println!("    merge                  - Compact sealed segments");
    println!("    info                   - Show engine statistics");
    println!("    exit                   - Shutdown engine");
    println!();

    let dir = std::env::args().nth(1).unwrap_or_else(|| "./data".to_string());
    let engine = match Cinder::open(Config::new(dir)) {
        Ok(e) => e,
        Err(err) => {
            eprintln!("[ERROR] Failed to open engine: {}", err);
            std::process::exit(1);
        }
    };

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("cinder> ");
        if stdout.flush().is_err() {
            break;
        }

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break, // EOF
            Ok(_) => {}
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }

        match parts[0].to_lowercase().as_str() {
            "set" | "put" => {
                if parts.len() < 3 {
                    println!("  Usage: set <key> <value>");
                    continue;
                }
                let key = parts[1].as_bytes().to_vec();
                let value = parts[2..].join(" ").into_bytes();
                match engine.put(key, value) {
                    Ok(()) => println!("  OK"),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "setex" => {
                let ttl = parts.get(2).and_then(|ms| ms.parse::<u64>().ok());
                let (Some(ttl), true) = (ttl, parts.len() >= 4) else {
                    println!("  Usage: setex <key> <ms> <value>");
                    continue;
                };
                let key = parts[1].as_bytes().to_vec();
                let value = parts[3..].join(" ").into_bytes();
                match engine.put_with_ttl(key, value, Duration::from_millis(ttl)) {
                    Ok(()) => println!("  OK"),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "get" => {
                if parts.len() < 2 {
                    println!("  Usage: get <key>");
                    continue;
                }
                match engine.get(parts[1].as_bytes()) {
                    Ok(value) => match String::from_utf8(value) {
                        Ok(s) => println!("  \"{}\"", s),
                        Err(_) => println!("  <binary data>"),
                    },
                    Err(CinderError::KeyNotFound) => println!("  (nil)"),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "del" | "delete" => {
                if parts.len() < 2 {
                    println!("  Usage: del <key>");
                    continue;
                }
                match engine.delete(parts[1].as_bytes()) {
                    Ok(()) => println!("  OK (deleted)"),
                    Err(CinderError::KeyNotFound) => println!("  (nil)"),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "ttl" => {
                if parts.len() < 2 {
                    println!("  Usage: ttl <key>");
                    continue;
                }
                match engine.ttl(parts[1].as_bytes()) {
                    Ok(Some(left)) => println!("  {} ms", left.as_millis()),
                    Ok(None) => println!("  (no expiry)"),
                    Err(CinderError::KeyNotFound) => println!("  (nil)"),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "scan" | "list" => {
                let mut opts = cinder::IterOptions::new();
                if let Some(prefix) = parts.get(1) {
                    opts = opts.prefix(*prefix);
                }
                let mut count = 0usize;
                let result = engine.iter(opts).and_then(|iter| {
                    for item in iter {
                        let (key, value) = item?;
                        println!(
                            "  {} -> {}",
                            String::from_utf8_lossy(&key),
                            String::from_utf8_lossy(&value)
                        );
                        count += 1;
                    }
                    Ok(())
                });
                match result {
                    Ok(()) if count == 0 => println!("  (empty)"),
                    Ok(()) => println!("  ({} entries)", count),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "keys" => {
                let result = engine.ascend_keys(None, |key| {
                    println!("  {}", String::from_utf8_lossy(key));
                    ControlFlow::Continue(())
                });
                if let Err(e) = result {
                    println!("  ERROR: {}", e);
                }
            }
            "merge" => match engine.compact() {
                Ok(stats) => println!(
                    "  Merged {} segments, reclaimed {} bytes",
                    stats.segments_in,
                    stats.reclaimed()
                ),
                Err(e) => println!("  ERROR: {}", e),
            },
            "info" | "stats" => match engine.stat() {
                Ok(stat) => {
                    println!("  Keys:      {}", stat.keys);
                    println!("  Segments:  {}", stat.segments);
                    println!("  Disk size: {} bytes", stat.disk_size);
                    println!("{}", engine.metrics().report());
                }
                Err(e) => println!("  ERROR: {}", e),
            },
            "exit" | "quit" | "q" => {
                println!("  Shutting down CINDER...");
                break;
            }
            _ => {
                println!("  Unknown command: '{}'. Type 'exit' to quit.", parts[0]);
            }
        }
    }

    if let Err(e) = engine.close() {
        eprintln!("[ERROR] Failed to close engine: {}", e);
    }
}
