//! Eval example: answer queries on a key until Ctrl-C.
//!
//! ```bash
//! cargo run --example eval -- --listener tcp/127.0.0.1:7447 --key /demo/example/eval
//! ```

use std::env;

use dataspace::queryable::{self, Query};
use dataspace::{QueryableKind, Sample, SessionConfig, Timestamp};

const DEFAULT_LISTENER: &str = "tcp/127.0.0.1:7447";
const DEFAULT_KEY: &str = "/demo/example/eval";
const DEFAULT_VALUE: &str = "Eval from Rust!";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut listener = DEFAULT_LISTENER.to_string();
    let mut key = DEFAULT_KEY.to_string();
    let mut value = DEFAULT_VALUE.to_string();

    let mut args = env::args().skip(1);
    while let Some(flag) = args.next() {
        let arg = args.next().ok_or_else(|| format!("missing value for {}", flag))?;
        match flag.as_str() {
            "-l" | "--listener" => listener = arg,
            "-k" | "--key" => key = arg,
            "-v" | "--value" => value = arg,
            other => return Err(format!("unknown option {}", other).into()),
        }
    }

    dataspace::logging::init_logger();

    println!("Opening session...");
    let config = SessionConfig::builder().listener(listener).build()?;
    let session = dataspace::open(config).await?;
    println!("Listening on {:?}", session.locators());

    println!("Declaring Queryable on '{}'...", key);
    let replier = session.id().clone();
    let res_name = key.clone();
    session.declare_queryable(
        key.as_str(),
        QueryableKind::EVAL,
        true,
        queryable::from_fn(move |query: Query| {
            println!(">> [Query handler] Handling '{}'", query.selector());
            let sample = Sample::new(res_name.clone(), value.clone())
                .with_timestamp(Timestamp::now(replier.clone()));
            async move {
                if let Err(e) = query.reply(sample) {
                    eprintln!("reply failed: {}", e);
                }
            }
        }),
    )?;

    tokio::signal::ctrl_c().await?;
    session.close();
    Ok(())
}
