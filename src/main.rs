//! The trellis-proxy binary.
//!
//! Loads the INI configuration, validates it (`-C` stops there and sets
//! the exit code), installs logging and runs the server.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use trellis_config::Settings;
use trellis_core::ProxyServer;

#[derive(Parser, Debug)]
#[command(
    name = "trellis-proxy",
    version,
    about = "Multi-protocol reverse proxy and load balancer"
)]
struct Args {
    /// Configuration file (INI).
    #[arg(short = 'c', long = "config", env = "TRELLIS_CONFIG")]
    config: Option<PathBuf>,

    /// Check the configuration and exit (0 = valid).
    #[arg(short = 'C', long = "check")]
    check: bool,

    /// Override [global] listen_port.
    #[arg(long)]
    listen_port: Option<u16>,

    /// Override [global] threads.
    #[arg(long)]
    threads: Option<usize>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    trellis_log::init();

    let mut settings = match &args.config {
        Some(path) => match Settings::load_file(path) {
            Ok(s) => s,
            Err(err) => {
                eprintln!("trellis-proxy: cannot load {}: {err}", path.display());
                return ExitCode::from(2);
            }
        },
        None => {
            let mut s = Settings::new();
            s.set("global", "listen_port", "8080");
            s
        }
    };

    if let Some(port) = args.listen_port {
        settings.set("global", "listen_port", &port.to_string());
    }
    if let Some(threads) = args.threads {
        settings.set("global", "threads", &threads.to_string());
    }

    if args.check {
        return match trellis_config::validate(&settings) {
            Ok(()) => {
                println!("configuration ok");
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("trellis-proxy: {err}");
                ExitCode::from(2)
            }
        };
    }

    let threads = settings.get_i64("global", "threads", 4).clamp(1, 512) as usize;
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("trellis-proxy: runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    let config_path = args.config.clone();
    let result = runtime.block_on(async move {
        let server = ProxyServer::from_settings(settings, config_path)?;
        server.run().await
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "proxy terminated");
            ExitCode::FAILURE
        }
    }
}
