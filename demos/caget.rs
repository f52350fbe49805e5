use clap::Parser;
use epicars_cac::{
    client::Client,
    dbr::{DbrCategory, DbrValue},
};

use tracing::level_filters::LevelFilter;

#[derive(Parser)]
struct Options {
    /// PV names to read
    #[clap(required = true, id = "PV_NAME")]
    names: Vec<String>,
    /// Also print units, limits and precision
    #[clap(short = 'd', long)]
    control: bool,
    /// Show debug output
    #[clap(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 1)]
async fn main() {
    let opts = Options::parse();

    tracing_subscriber::fmt()
        .with_max_level(match opts.verbose {
            0 => LevelFilter::WARN,
            1 => LevelFilter::DEBUG,
            2.. => LevelFilter::TRACE,
        })
        .init();

    let client = match Client::new().await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Could not start client: {e}");
            std::process::exit(1);
        }
    };

    let mut failed = false;
    for name in opts.names {
        if opts.control {
            match client.get_dbr(&name, DbrCategory::Control).await {
                Ok(dbr) => println!("{name}\n    {dbr:?}"),
                Err(e) => {
                    println!("{name}: {e}");
                    failed = true;
                }
            }
            continue;
        }
        let res: Result<DbrValue, _> = client.read_pv(&name).await;
        match res {
            Ok(value) => println!("{name:<30} {}", format_value(&value)),
            Err(e) => {
                println!("{name}: {e}");
                failed = true;
            }
        }
    }
    if failed {
        std::process::exit(1);
    }
}

fn format_value(value: &DbrValue) -> String {
    fn join<T: ToString>(items: &[T]) -> String {
        items
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ")
    }
    match value {
        DbrValue::Enum(v) => join(v),
        DbrValue::String(v) => v.join(" "),
        DbrValue::Char(v) => join(v),
        DbrValue::Int(v) => join(v),
        DbrValue::Long(v) => join(v),
        DbrValue::Float(v) => join(v),
        DbrValue::Double(v) => join(v),
    }
}
