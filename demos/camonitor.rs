use std::time::SystemTime;

use clap::Parser;
use epicars_cac::{
    client::{Client, ClientError, SubscriberRecvError},
    dbr::DbrValue,
};

use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
struct Options {
    /// PV name to monitor
    #[clap(required = true, id = "PV_NAME")]
    name: String,
    /// Show debug output
    #[clap(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 1)]
async fn main() {
    let opts = Options::parse();

    let filter = EnvFilter::default().add_directive(
        match opts.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            2.. => LevelFilter::TRACE,
        }
        .into(),
    );
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_filter(filter);
    tracing_subscriber::registry().with(fmt_layer).init();

    let client = match Client::new().await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Could not start client: {e}");
            std::process::exit(1);
        }
    };
    let mut monitor = match client.subscribe::<DbrValue>(&opts.name).await {
        Ok(monitor) => monitor,
        Err(e) => {
            eprintln!("{}: {e}", opts.name);
            std::process::exit(1);
        }
    };

    loop {
        let dbr = match monitor.recv_dbr().await {
            Ok(dbr) => dbr,
            Err(SubscriberRecvError::Client(ClientError::Disconnected)) => {
                println!("{} *** disconnected", opts.name);
                continue;
            }
            Err(SubscriberRecvError::Lagged(n)) => {
                info!("Dropped {n} updates");
                continue;
            }
            Err(e) => {
                println!("{} *** {e}", opts.name);
                break;
            }
        };
        let display = match dbr.value() {
            DbrValue::String(s) => s.join(" "),
            DbrValue::Enum(v) => join(v),
            DbrValue::Char(v) => join(v),
            DbrValue::Int(v) => join(v),
            DbrValue::Long(v) => join(v),
            DbrValue::Float(v) => join(v),
            DbrValue::Double(v) => join(v),
        };
        let stamp = dbr
            .timestamp()
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| format!("{}.{:09}", d.as_secs(), d.subsec_nanos()))
            .unwrap_or_default();
        println!("{:<30} {stamp} {display}", opts.name);
    }
}

fn join<T: ToString>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}
