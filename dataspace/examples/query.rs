//! Query example: send one query and print every reply for a second.
//!
//! ```bash
//! # Terminal 1 - a queryable listening on TCP
//! cargo run --example eval
//!
//! # Terminal 2 - query it
//! cargo run --example query -- --mode client --peer tcp/127.0.0.1:7447
//! ```
//!
//! Options:
//!
//! - `-m, --mode <peer|client>`   session mode (default: peer)
//! - `-e, --peer <LOCATOR>`       peer to connect to, repeatable
//! - `-l, --listener <LOCATOR>`   locator to listen on, repeatable
//! - `-s, --selector <SELECTOR>`  resources to query (default: /demo/example/**)
//! - `-c, --config <FILE>`        JSON session config; other options are ignored

use std::env;
use std::time::Duration;

use dataspace::{query, Reply, SessionConfig, WhatAmI};

const DEFAULT_SELECTOR: &str = "/demo/example/**";

struct Args {
    config: SessionConfig,
    selector: String,
}

fn parse_args() -> Result<Args, Box<dyn std::error::Error>> {
    let mut builder = SessionConfig::builder();
    let mut selector = DEFAULT_SELECTOR.to_string();
    let mut config_file = None;

    let mut args = env::args().skip(1);
    while let Some(flag) = args.next() {
        let mut value = || args.next().ok_or_else(|| format!("missing value for {}", flag));
        match flag.as_str() {
            "-m" | "--mode" => builder = builder.mode(value()?.parse::<WhatAmI>()?),
            "-e" | "--peer" => builder = builder.peer(value()?),
            "-l" | "--listener" => builder = builder.listener(value()?),
            "-s" | "--selector" => selector = value()?,
            "-c" | "--config" => config_file = Some(value()?),
            other => return Err(format!("unknown option {}", other).into()),
        }
    }

    let config = match config_file {
        Some(path) => SessionConfig::from_file(path)?,
        None => builder.build()?,
    };
    Ok(Args { config, selector })
}

fn print_reply(reply: &Reply) {
    let time = match reply.timestamp() {
        Some(ts) => ts.time.to_string(),
        None => "(not specified)".to_string(),
    };
    println!(
        ">> [Reply handler] received ('{}': '{}') published at {}",
        reply.res_name,
        reply.payload_str(),
        time
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let Args { config, selector } = parse_args()?;
    dataspace::logging::init_logger();

    println!("Opening session...");
    let session = dataspace::open(config).await?;

    println!("Sending Query '{}'...", selector);
    session.query(
        selector.as_str(),
        "",
        query::from_fn(|reply: &Reply| {
            print_reply(reply);
            Ok(())
        }),
    )?;

    tokio::time::sleep(Duration::from_secs(1)).await;

    session.close();
    Ok(())
}
