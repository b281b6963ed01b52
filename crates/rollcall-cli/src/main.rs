use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_hw::{Camera, FrameSource, SourceOptions};
use rollcall_ledger::{export_csv, Action, Ledger, LedgerConfig};
use rollcalld::config::Config;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    fn punch(&self, action: &str) -> zbus::Result<String>;
    fn punch_subject(&self, subject_id: i64, action: &str) -> zbus::Result<String>;
    fn register(&self, name: &str) -> zbus::Result<i64>;
    fn reset_session(&self) -> zbus::Result<()>;
    fn set_modes(&self, auto: bool, manual: bool) -> zbus::Result<()>;
    fn snapshot(&self) -> zbus::Result<(u32, u32, Vec<u8>)>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance station CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register the person in front of the camera
    Register {
        #[arg(short, long)]
        name: String,
    },
    /// Punch in or out (PUNCH_IN / PUNCH_OUT, or in / out)
    Punch {
        action: Action,
        /// Punch this ledger subject instead of the recognized person
        #[arg(long)]
        subject: Option<i64>,
    },
    /// Clear the daemon's session and require a fresh blink
    Reset,
    /// Enable or disable automatic and manual punching
    Modes {
        #[arg(long)]
        auto: bool,
        #[arg(long)]
        manual: bool,
    },
    /// Show daemon status
    Status,
    /// Save the latest annotated frame as an image
    Snapshot { output: PathBuf },
    /// Print or export the attendance report, newest first
    Report {
        /// Ledger database (default: the daemon's configured db_path)
        #[arg(long)]
        db: Option<PathBuf>,
        /// Write CSV here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List cameras, or measure capture from one without the daemon
    Test {
        /// Device to capture from; lists devices when omitted
        device: Option<String>,
        #[arg(long, default_value_t = 3)]
        seconds: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Report { db, output } => {
            let db = report_db_path(db, |key| std::env::var(key).ok())?;
            let total = report(&db, output.as_deref())?;
            eprintln!("Total Records: {total}");
        }
        Commands::Test { device, seconds } => camera_test(device.as_deref(), seconds)?,
        command => {
            let conn = if cli.system {
                zbus::Connection::system().await
            } else {
                zbus::Connection::session().await
            }
            .context("cannot connect to D-Bus")?;
            let proxy = AttendanceProxy::new(&conn)
                .await
                .context("rollcalld is not reachable")?;
            daemon_command(&proxy, command).await?;
        }
    }

    Ok(())
}

async fn daemon_command(proxy: &AttendanceProxy<'_>, command: Commands) -> Result<()> {
    match command {
        Commands::Register { name } => {
            let id = proxy.register(&name).await.map_err(advisory)?;
            println!("User {name} registered successfully! (subject {id})");
        }
        Commands::Punch { action, subject } => {
            let message = match subject {
                Some(id) => proxy.punch_subject(id, action.as_str()).await,
                None => proxy.punch(action.as_str()).await,
            }
            .map_err(advisory)?;
            println!("{message}");
        }
        Commands::Reset => {
            proxy.reset_session().await.map_err(advisory)?;
            println!("Session reset! All users cleared.");
        }
        Commands::Modes { auto, manual } => {
            proxy.set_modes(auto, manual).await.map_err(advisory)?;
            println!("auto mode: {}, manual mode: {}", on_off(auto), on_off(manual));
        }
        Commands::Status => {
            let json = proxy.status().await.map_err(advisory)?;
            let value: serde_json::Value = serde_json::from_str(&json)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Snapshot { output } => {
            let (width, height, data) = proxy.snapshot().await.map_err(advisory)?;
            let img = image::RgbImage::from_raw(width, height, data)
                .context("daemon returned a malformed frame")?;
            img.save(&output)
                .with_context(|| format!("cannot write {}", output.display()))?;
            println!("Saved {width}x{height} frame to {}", output.display());
        }
        Commands::Report { .. } | Commands::Test { .. } => {}
    }
    Ok(())
}

/// Strip the D-Bus error name so the daemon's message reads as-is.
fn advisory(e: zbus::Error) -> anyhow::Error {
    match e {
        zbus::Error::MethodError(_, Some(message), _) => anyhow::anyhow!(message),
        other => other.into(),
    }
}

fn on_off(b: bool) -> &'static str {
    if b {
        "on"
    } else {
        "off"
    }
}

/// The ledger `report` reads: `--db`, else whatever the daemon's
/// configuration resolves to.
fn report_db_path(
    explicit: Option<PathBuf>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => Ok(Config::load_from(env)
            .context("cannot load rollcall configuration")?
            .db_path),
    }
}

fn report(db: &Path, output: Option<&Path>) -> Result<usize> {
    if !db.exists() {
        bail!("no attendance database at {}", db.display());
    }
    let ledger = Ledger::open(db, LedgerConfig::default())?;
    let rows = ledger.report()?;
    tracing::debug!(db = %db.display(), rows = rows.len(), "report loaded");
    let total = match output {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("cannot create {}", path.display()))?;
            export_csv(&rows, file)?
        }
        None => export_csv(&rows, std::io::stdout().lock())?,
    };
    Ok(total)
}

fn camera_test(device: Option<&str>, seconds: u64) -> Result<()> {
    let Some(device) = device else {
        let devices = Camera::list_devices();
        if devices.is_empty() {
            println!("No video capture devices found");
        }
        for d in devices {
            println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
        }
        return Ok(());
    };

    println!("Capturing from {device} for {seconds}s...");
    let mut source = FrameSource::open_path(device, SourceOptions::default())?;
    let started = Instant::now();
    std::thread::sleep(Duration::from_secs(seconds));
    let stats = source.stats();
    let frame = source.latest();
    source.close();

    let elapsed = started.elapsed().as_secs_f64();
    println!(
        "frames: {}  failed reads: {}  rate: {:.1} fps",
        stats.frames_captured,
        stats.failed_reads,
        stats.frames_captured as f64 / elapsed
    );
    match frame {
        Some(f) => println!("latest frame: {}x{}", f.width, f.height),
        None => println!("no frame captured"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_actions() {
        let cli = Cli::try_parse_from(["rollcall", "punch", "in"]).unwrap();
        assert!(matches!(cli.command, Commands::Punch { action: Action::PunchIn, subject: None }));
        let cli = Cli::try_parse_from(["rollcall", "punch", "PUNCH_OUT", "--subject", "3"]).unwrap();
        assert!(matches!(cli.command, Commands::Punch { action: Action::PunchOut, subject: Some(3) }));
        assert!(Cli::try_parse_from(["rollcall", "punch", "lunch"]).is_err());
    }

    #[test]
    fn test_report_writes_csv_file() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("attendance.db");
        {
            let mut ledger = Ledger::open(&db, LedgerConfig::default()).unwrap();
            let alice = ledger.add_subject("alice").unwrap();
            ledger.record(alice.id, Action::PunchIn).unwrap();
            ledger.record(alice.id, Action::PunchOut).unwrap();
        }
        let out = dir.path().join("report.csv");
        assert_eq!(report(&db, Some(&out)).unwrap(), 2);
        let text = std::fs::read_to_string(&out).unwrap();
        assert!(text.starts_with("name,action,timestamp\n"));
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn test_report_db_follows_daemon_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("rollcall.toml");
        let db = dir.path().join("site.db");
        std::fs::write(&config, format!("db_path = {:?}\n", db.to_str().unwrap())).unwrap();
        let config = config.to_str().unwrap().to_string();
        let env = move |key: &str| match key {
            "ROLLCALL_CONFIG" => Some(config.clone()),
            "HOME" => Some("/h".to_string()),
            _ => None,
        };
        assert_eq!(report_db_path(None, &env).unwrap(), db);

        let explicit = dir.path().join("other.db");
        assert_eq!(report_db_path(Some(explicit.clone()), &env).unwrap(), explicit);
    }

    #[test]
    fn test_report_missing_db() {
        let dir = tempfile::tempdir().unwrap();
        assert!(report(&dir.path().join("none.db"), None).is_err());
    }
}
