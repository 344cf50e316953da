use args::Args;
use getopts::Occur;
use glob::glob;
use heap_reach::HeapSnapshot;
use tracing::info;
use tracing_subscriber::EnvFilter;

const PROGRAM_DESC: &str = "Visualize heap_reach snapshots";
const PROGRAM_NAME: &str = "hr_print";

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut args = Args::new(PROGRAM_NAME, PROGRAM_DESC);
    args.option(
        "d",
        "dir",
        "Directory that stores target snapshots",
        "DIR",
        Occur::Req,
        None,
    );
    args.option(
        "m",
        "min-bytes",
        "Hide allocation sites holding fewer bytes",
        "BYTES",
        Occur::Optional,
        Some("0".to_string()),
    );

    args.parse_from_cli()?;

    let dir: String = args.value_of("dir")?;
    let min_bytes: usize = args.value_of("min-bytes")?;
    let wildcard = format!("{}/snapshot.*.yaml", dir);

    // Aggregate all snapshots found in the directory.
    let mut aggregate = HeapSnapshot::new();
    for path in glob(wildcard.as_str())? {
        let path = path?;
        info!("found snapshot in {}", path.display());
        aggregate.merge(&HeapSnapshot::load(&path)?);
    }

    let mut out = String::new();
    aggregate.fmt_with_threshold(min_bytes, &mut out)?;
    print!("{}", out);

    Ok(())
}
