use anyhow::Context as _;
use clap::{Parser, Subcommand};
use ridgeline::{
    common::paths, Config, ConnId, Device, ImageDirSource, MatchEngine, StaticAuthority,
    TemplateStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "ridgeline")]
#[command(about = "Fingerprint matching and session authorization engine")]
struct Cli {
    /// Config file (defaults to the system config when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Template storage directory override
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a finger from a directory of scan images
    Enroll {
        #[arg(short, long)]
        username: String,
        /// Finger label, e.g. right-index-finger
        #[arg(short, long, default_value = "right-index-finger")]
        finger: String,
        /// Directory of grayscale scan images, replayed in filename order
        #[arg(long)]
        frames: PathBuf,
    },
    /// Run a verification session against a directory of scan images
    Verify {
        #[arg(short, long)]
        username: String,
        #[arg(long)]
        frames: PathBuf,
    },
    /// List enrolled fingers for a user
    ListFingers {
        #[arg(short, long)]
        username: String,
    },
    /// Delete all enrolled fingers for a user
    Delete {
        #[arg(short, long)]
        username: String,
    },
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => {
            let system = paths::system_config_file();
            if system.exists() {
                Config::load_from_path(&system)?
            } else {
                Config::default()
            }
        }
    };
    if let Some(data_dir) = &cli.data_dir {
        config.storage.data_dir = data_dir.clone();
    }
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let store = TemplateStore::new(config.storage.data_dir.clone())?;
    let engine = Arc::new(MatchEngine::new(store, config.clone())?);

    match cli.command {
        Commands::Enroll {
            username,
            finger,
            frames,
        } => {
            let source = Arc::new(
                ImageDirSource::open(&frames, config.enroll.clear_polls)
                    .context("loading scan images")?,
            );
            let device = Device::spawn(
                engine,
                source,
                Arc::new(StaticAuthority::allow_all()),
                config,
            );
            let handle = device.handle();
            let conn = ConnId(1);

            handle.claim(&username, conn)?;
            let events = handle.subscribe(conn)?;
            handle.enroll_start(conn, &finger)?;

            println!("Enrolling {}_{} ...", username, finger);
            drain_events(&events)?;
            handle.release(conn)?;
        }
        Commands::Verify { username, frames } => {
            let source = Arc::new(
                ImageDirSource::open(&frames, config.enroll.clear_polls)
                    .context("loading scan images")?,
            );
            let device = Device::spawn(
                engine,
                source,
                Arc::new(StaticAuthority::allow_all()),
                config,
            );
            let handle = device.handle();
            let conn = ConnId(1);

            handle.claim(&username, conn)?;
            let events = handle.subscribe(conn)?;
            handle.verify_start(conn, "")?;

            println!("Touch the sensor ...");
            let matched = drain_events(&events)?;
            handle.cancel(conn).ok();
            handle.release(conn)?;
            if !matched {
                std::process::exit(1);
            }
        }
        Commands::ListFingers { username } => {
            for finger in engine.list_fingers(&username)? {
                println!("{}", finger);
            }
        }
        Commands::Delete { username } => {
            let removed = engine.delete_user(&username)?;
            println!("Removed {} enrolled finger(s)", removed);
        }
    }

    Ok(())
}

/// Print signals until the terminal one, or until the replayed frames run
/// dry. True when the terminal signal was a success.
fn drain_events(events: &std::sync::mpsc::Receiver<ridgeline::DeviceEvent>) -> anyhow::Result<bool> {
    use ridgeline::service::events::{DeviceEvent, EnrollResult, VerifyResult};

    loop {
        match events.recv_timeout(Duration::from_secs(5)) {
            Ok(event) => {
                let (label, done, ok) = match event {
                    DeviceEvent::VerifyStatus { result, done } => (
                        result.as_str(),
                        done,
                        matches!(result, VerifyResult::Match),
                    ),
                    DeviceEvent::EnrollStatus { result, done } => (
                        result.as_str(),
                        done,
                        matches!(result, EnrollResult::Completed),
                    ),
                };
                println!("  {}", label);
                if done {
                    return Ok(ok);
                }
            }
            Err(_) => {
                println!("  (no more scans)");
                return Ok(false);
            }
        }
    }
}
