// EMA Gateway
//
// Copyright: 2026, EMA Project
// License: Public Domain License

#[macro_use]
extern crate log;

use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::mpsc::{Receiver, Sender, TryRecvError};

use ema_gateway::config::Config;
use ema_gateway::protocol::status::Reading;

const THREAD_SLEEP_THROTTLE: std::time::Duration = std::time::Duration::from_millis(10);

#[derive(Debug, Parser)]
#[command(author, about, version)]
struct Opts {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Debug, Subcommand)]
enum Mode {
    /// Run the gateway against the serial-attached station controller
    Run(Run),

    /// Parse and validate a configuration file, print the derived setup
    Check(Check),

    /// Replay a recorded bulletin capture through the decoder to stdout
    Play(Play),
}

#[derive(Debug, Args)]
struct Run {
    /// Path of the configuration file
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    /// Append every inbound frame to this capture file
    #[arg(long = "record")]
    record: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct Check {
    /// Path of the configuration file
    #[arg(short = 'c', long = "config")]
    config: PathBuf,
}

#[derive(Debug, Args)]
struct Play {
    /// Path of the capture file
    #[arg(short = 'i')]
    input: PathBuf,

    /// Decode as fast as possible instead of the natural ~1 Hz pace
    #[arg(long = "full-blast")]
    full_blast: bool,
}

fn main() {
    env_logger::init();
    let opts = Opts::parse();

    match opts.mode {
        Mode::Run(cfg) => run(cfg),
        Mode::Check(cfg) => check(cfg),
        Mode::Play(cfg) => play(cfg),
    }
}

fn load_config(path: &Path) -> Config {
    match Config::load(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{}", e);
            exit(e.exit_code());
        }
    }
}

fn run(opts: Run) {
    let cfg = load_config(&opts.config);
    let capture = opts.record.map(|path| {
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) => {
                error!("could not open capture file {}: {}", path.display(), e);
                exit(2);
            }
        }
    });
    if let Err(e) = ema_gateway::run(cfg, capture) {
        error!("{}", e);
        exit(e.exit_code());
    }
}

fn check(opts: Check) {
    let cfg = load_config(&opts.config);
    println!("configuration OK");
    println!("serial: {} @ {} baud", cfg.serial_port, cfg.baud);
    match &cfg.mqtt {
        Some(mqtt) => println!("broker: {}:{} as {}", mqtt.host, mqtt.port, mqtt.client_id),
        None => println!("broker: none"),
    }
    match &cfg.udp {
        Some(udp) => println!("companion proxy: rx udp/{} tx udp/{}", udp.rx_port, udp.tx_port),
        None => println!("companion proxy: none"),
    }
    println!("time-of-day windows: {}", cfg.windows.len());
    for settings in &cfg.instruments {
        for (parameter, value) in &settings.configured {
            println!(
                "{}.{} = {} {}",
                settings.kind.label(),
                parameter.name,
                value,
                parameter.units
            );
        }
    }
}

fn play(opts: Play) {
    let file = match std::fs::File::open(&opts.input) {
        Ok(file) => file,
        Err(e) => {
            error!("could not open capture {}: {}", opts.input.display(), e);
            exit(2);
        }
    };
    let (tx, rx): (Sender<Reading>, Receiver<Reading>) = std::sync::mpsc::channel();
    let enable_time_simulation = !opts.full_blast;
    std::thread::spawn(move || {
        info!("start replaying bulletin capture");
        ema_gateway::replay(file, tx, enable_time_simulation);
    });

    loop {
        match rx.try_recv() {
            Ok(reading) => {
                println!("{:?}", reading);
            }
            Err(TryRecvError::Empty) => {
                std::thread::sleep(THREAD_SLEEP_THROTTLE);
            }
            Err(TryRecvError::Disconnected) => {
                warn!("end of capture");
                exit(0);
            }
        }
    }
}
