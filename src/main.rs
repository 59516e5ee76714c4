use clap::{Parser, Subcommand};
use rawdata::registry::registry;
use rawdata::{Config, Dataset, RawDataError};
use std::path::PathBuf;
use std::process;

#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect and analyse raw sensor datasets", long_about = None)]
struct Args {
    /// Settings file to use instead of the platform default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rebuild the time-base and save the dataset
    Analyse { dir: PathBuf },
    /// Print identity and computed metadata
    Info { dir: PathBuf },
    /// List channels in display order
    Channels { dir: PathBuf },
    /// List annotation events
    Events { dir: PathBuf },
}

fn open(dir: PathBuf, config: &Config) -> Result<Dataset, RawDataError> {
    let mut dataset = Dataset::with_config(Some(dir), config.clone());
    dataset.load()?;
    Ok(dataset)
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.4}", v))
}

fn run(command: Command, config: &Config) -> Result<(), RawDataError> {
    match command {
        Command::Analyse { dir } => {
            let mut dataset = open(dir, config)?;
            let report = dataset.analyse()?;
            dataset.save(false)?;
            println!(
                "primary: {}",
                report.primary.as_deref().unwrap_or("none (non-real)")
            );
            println!(
                "gaps: {} candidates, {} confirmed",
                report.gap_candidates.len(),
                report.inserts.len()
            );
            println!("missing samples: {}", report.missing_samples);
            if let Some(fit) = report.linear_fit {
                println!("drift: m={:.3e} b={:.4}", fit.m, fit.b);
            }
        }
        Command::Info { dir } => {
            let dataset = open(dir, config)?;
            let meta = dataset.meta();
            let db = &meta.db;
            let rd = &meta.rd;
            println!("rd_version:        {}", meta.rd_version);
            println!("session:           {}", db.session_id.as_deref().unwrap_or("-"));
            println!("device:            {}", db.device_id.as_deref().unwrap_or("-"));
            println!(
                "start:             {}",
                db.start_time().map_or_else(|| "-".to_string(), |t| t.to_rfc3339())
            );
            println!("duration [s]:      {}", fmt_opt(rd.duration));
            println!("transfer rate:     {}", fmt_opt(rd.transfer_rate_all));
            println!("sampling rate:     {}", fmt_opt(rd.sampling_rate_real));
            println!(
                "quality g/y/r:     {} / {} / {}",
                fmt_opt(rd.quality_green),
                fmt_opt(rd.quality_yellow),
                fmt_opt(rd.quality_red)
            );
            println!(
                "battery:           {} -> {}",
                fmt_opt(rd.battery_start),
                fmt_opt(rd.battery_end)
            );
            println!(
                "linear fit m/b:    {} / {}",
                fmt_opt(rd.linear_fit_m),
                fmt_opt(rd.linear_fit_b)
            );
        }
        Command::Channels { dir } => {
            let mut dataset = open(dir, config)?;
            for identifier in dataset.identifiers()? {
                let unit = registry().get(&identifier).map_or("", |info| info.unit);
                let channel = dataset.channel(&identifier)?;
                let meta = channel.meta();
                println!(
                    "{:<32} {:>9} samples  min {:>10}  max {:>10}  {}",
                    identifier,
                    channel.len(),
                    fmt_opt(meta.min),
                    fmt_opt(meta.max),
                    unit
                );
            }
        }
        Command::Events { dir } => {
            let dataset = open(dir, config)?;
            for event in dataset.events() {
                println!(
                    "#{:<4} {:>10.1} s .. {:>10.1} s  {}  {}",
                    event.id, event.x_start, event.x_end, event.category, event.description
                );
            }
        }
    }
    Ok(())
}

fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            log::warn!("Using default settings: {}", e);
            Config::default()
        }
    };

    if let Err(e) = run(args.command, &config) {
        log::error!("{}", e);
        process::exit(1);
    }
}
