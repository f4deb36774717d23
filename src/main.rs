use std::{env, path, sync::Arc, time::Instant};

use dotenv::dotenv;
use mccrawler::{
    config::Config,
    database::Database,
    exclude::{self, Ipv4Ranges},
    probe::MinecraftProber,
    scanner::{
        masscan::{FileSource, MasscanSource},
        spawn_pipeline,
    },
    terminal_colors::*,
    tracing::init_tracing,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenv().ok();

    // first command line argument is the location of the config file
    let args = env::args().collect::<Box<[String]>>();
    let config_file = args.get(1).cloned().unwrap_or("config.toml".to_string());
    let config_file_path = path::Path::new(&config_file).canonicalize()?;
    println!(
        "parsing config at {}",
        config_file_path.as_os_str().to_string_lossy()
    );
    let config = Config::from_file(&config_file_path)?;

    init_tracing(&config);
    info!("Logging initialized");

    let exclude_ranges = match &config.scanner.exclude_file {
        Some(exclude_file) => {
            let ranges = exclude::parse_file(exclude_file)?;
            println!("excluding {} ranges", ranges.len());
            ranges
        }
        None => Ipv4Ranges::default(),
    };
    let exclude_ranges = Arc::new(exclude_ranges);

    let database = Database::connect(config.database_url()?).await?;

    let prober = Arc::new(MinecraftProber::new(config.probe.settings()));
    let (sender, pipeline) = spawn_pipeline(prober, database, config.pipeline());

    let start = Instant::now();

    // the source owns the only sender, so the pipeline closes once it's done
    let source = if let Some(input_file) = &config.scanner.input_file {
        FileSource {
            path: input_file.clone(),
        }
        .spawn(sender, exclude_ranges)
        .await?
    } else {
        let Some(range) = config.scanner.range.clone() else {
            eyre::bail!("scanner.range must be set");
        };
        MasscanSource {
            masscan_path: config.scanner.masscan_path.clone(),
            range,
            ports: config.scanner.ports.clone(),
            rate: config.scanner.rate,
            exclude_file: config.scanner.exclude_file.clone(),
        }
        .spawn(sender, exclude_ranges)?
    };

    let source_stats = match source.await {
        Ok(stats) => stats,
        Err(err) => {
            warn!("candidate source panicked: {err}");
            Default::default()
        }
    };
    println!("{GRAY}source is done, waiting for probes to finish...{RESET}");

    let (database, summary) = pipeline.join().await?;
    let total = database.count_servers().await?;

    println!(
        "{BOLD}done in {:?}{RESET}: probed {}, found {GREEN}{}{RESET}, failed {}, excluded {}",
        start.elapsed(),
        summary.probed,
        summary.found,
        summary.failed,
        source_stats.excluded,
    );
    println!(
        "wrote {} servers in {} batches ({} batches failed), {total} servers in the database",
        summary.flush.records_written, summary.flush.batches_flushed, summary.flush.batches_failed,
    );
    info!(
        probed = summary.probed,
        found = summary.found,
        failed = summary.failed,
        records_written = summary.flush.records_written,
        batches_failed = summary.flush.batches_failed,
        "scan finished"
    );

    Ok(())
}
