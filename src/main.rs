use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use kfmon::{config, daemon, monitor, mount};

struct Args {
    mountpoint: PathBuf,
    config_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    logfile: PathBuf,
    foreground: bool,
}

fn print_usage() {
    eprintln!("kfmon - Kobo inotify-based launcher daemon");
    eprintln!();
    eprintln!("Usage: kfmon [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --mountpoint <path>  Device partition to wait for (default: /mnt/onboard)");
    eprintln!("  --config-dir <path>  Config directory (default: <mountpoint>/.adds/kfmon/config)");
    eprintln!("  --db <path>          Kobo content database (default: <mountpoint>/.kobo/KoboReader.sqlite)");
    eprintln!("  --log <path>         Logfile for daemon mode (default: {})", daemon::DEFAULT_LOGFILE);
    eprintln!("  -f, --foreground     Don't daemonize, log to the terminal");
    eprintln!("  -h, --help           Show this help");
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Option<Args>, String> {
    let mut parsed = Args {
        mountpoint: PathBuf::from(config::DEFAULT_MOUNTPOINT),
        config_dir: None,
        db_path: None,
        logfile: PathBuf::from(daemon::DEFAULT_LOGFILE),
        foreground: false,
    };

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_usage();
                return Ok(None);
            }
            "-f" | "--foreground" => parsed.foreground = true,
            "--mountpoint" => parsed.mountpoint = next_value(&mut args, "--mountpoint")?,
            "--config-dir" => parsed.config_dir = Some(next_value(&mut args, "--config-dir")?),
            "--db" => parsed.db_path = Some(next_value(&mut args, "--db")?),
            "--log" => parsed.logfile = next_value(&mut args, "--log")?,
            other => return Err(format!("unknown argument: {other}")),
        }
    }

    Ok(Some(parsed))
}

fn next_value(
    args: &mut impl Iterator<Item = String>,
    flag: &str,
) -> Result<PathBuf, String> {
    args.next()
        .map(PathBuf::from)
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn run(args: Args) -> anyhow::Result<()> {
    // udev hands us a negative nice value; put ourselves back behind Nickel.
    daemon::renice(2)?;
    if !args.foreground {
        daemon::daemonize(&args.logfile)?;
    }

    // After daemonize so the subscriber's stderr is the redirected one.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_dir = args
        .config_dir
        .unwrap_or_else(|| config::default_config_dir(&args.mountpoint));
    let db_path = args
        .db_path
        .unwrap_or_else(|| config::default_db_path(&args.mountpoint));

    // The config lives on the device partition, so the very first mount
    // wait has to happen before we can load anything.
    mount::wait_for_mountpoint(&args.mountpoint)?;
    let config = config::load_config(&config_dir)?;

    monitor::run(&config, &args.mountpoint, &db_path)
}

fn main() -> ExitCode {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(Some(args)) => args,
        Ok(None) => return ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("kfmon: {msg}");
            eprintln!();
            print_usage();
            return ExitCode::from(2);
        }
    };

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("kfmon: fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}
