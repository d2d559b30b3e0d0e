// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! CLI tool for UPI validation (upival)

#[cfg(feature = "cli")]
use clap::{Parser, Subcommand, ValueEnum};
#[cfg(feature = "cli")]
use colored::Colorize;
#[cfg(feature = "cli")]
use std::path::PathBuf;
#[cfg(feature = "cli")]
use std::time::Duration;

#[cfg(feature = "cli")]
use upilib::campaign::{CampaignOutcome, CycleBudget, Driver, TestCase, Workload};
#[cfg(feature = "cli")]
use upilib::degrade::{os_socket_count, DegradationPlan};
#[cfg(feature = "cli")]
use upilib::platform::registers::{self, RegisterKind};
#[cfg(feature = "cli")]
use upilib::platform::PlatformFamily;
#[cfg(feature = "cli")]
use upilib::sim::{simulated_sut, SharedSim, SimState};
#[cfg(feature = "cli")]
use upilib::sut::local::LocalShell;
#[cfg(feature = "cli")]
use upilib::sut::ResetKind;
#[cfg(feature = "cli")]
use upilib::topology::PortId;
#[cfg(feature = "cli")]
use upilib::{UpiCheck, UpiConfig, UpiError};

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "upival")]
#[command(about = "UPI link-state verification, degradation and cyclic stress campaigns", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text", global = true)]
    format: OutputFormat,
}

#[cfg(feature = "cli")]
#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Commands {
    /// Print the register path for a family, register kind and port
    Resolve {
        /// Platform family (ICX, SPR, EMR, GNR)
        #[arg(long)]
        family: PlatformFamily,
        /// Register kind (lane_status, rx_state, tx_state, link_speed, error_parent)
        #[arg(long)]
        kind: RegisterKind,
        #[arg(long)]
        port: u32,
        /// IO die, only used on families with an IO-die split
        #[arg(long)]
        io_die: Option<u32>,
    },
    /// Detect the platform family of this host from its CPU model
    Detect,
    /// Compare the socket count lscpu reports on this host
    Sockets {
        #[arg(long)]
        expect: u32,
    },
    /// Print a sample configuration file
    SampleConfig,
    /// Run a campaign driver against the simulated platform
    Simulate {
        #[command(subcommand)]
        driver: SimDriver,

        /// Platform family to simulate; falls back to the config, then SPR
        #[arg(long, global = true)]
        family: Option<PlatformFamily>,

        /// Socket count; 2 and 4 use fixed meshes, others a seeded random one
        #[arg(long, default_value_t = 2, global = true)]
        sockets: u32,

        /// Check run every cycle
        #[arg(long, default_value = "lane", global = true)]
        check: UpiCheck,

        /// Seed for random meshes and degradation plans
        #[arg(long, default_value_t = 0, global = true)]
        seed: u64,
    },
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum SimDriver {
    /// Fixed cycle count under stressapptest
    Stress {
        #[arg(long, default_value_t = 3)]
        cycles: u32,
    },
    /// Reset cycling bounded by a wall-clock budget
    Resets {
        #[arg(long, default_value_t = 2000)]
        cycles: u32,
        #[arg(long, default_value = "warm")]
        kind: ResetKind,
        #[arg(long, default_value_t = 12.0)]
        hours: f64,
        /// Simulated time one reset takes
        #[arg(long, default_value_t = 10)]
        reset_minutes: u64,
    },
    /// Periodic checks without load
    Idle {
        #[arg(long, default_value_t = 2.0)]
        hours: f64,
    },
    /// MLC load followed by the bandwidth matrix comparison
    Bandwidth {
        #[arg(long, default_value_t = 1.0)]
        hours: f64,
    },
    /// Disable ports and verify the degraded links
    Degrade {
        /// Ports to disable, e.g. S0P1; random one per socket if empty
        #[arg(long, value_delimiter = ',')]
        ports: Vec<PortId>,
        /// Verify by OS socket count instead of per port
        #[arg(long)]
        socket_count: Option<u32>,
        #[arg(long, default_value_t = 0)]
        mlc_cycles: u32,
    },
    /// Idle polling of the C6 link states with PTU residency sampling
    PackageC6 {
        #[arg(long, default_value_t = 1)]
        minutes: u64,
        #[arg(long, default_value_t = 30)]
        poll_secs: u64,
    },
    /// Error-rate checks under the STREAM benchmark
    Stream {
        #[arg(long, default_value_t = 2.0)]
        hours: f64,
        /// Benchmark build passed to run_stream.sh
        #[arg(long, default_value = "avx3")]
        stream_type: String,
    },
}

#[cfg(feature = "cli")]
fn main() {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match UpiConfig::from_toml_file(&path.to_string_lossy()) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{} {}", "[ERROR]".red().bold(), e);
                std::process::exit(2);
            }
        },
        None => UpiConfig::default(),
    };

    env_logger::Builder::new()
        .filter_level(config.log_level.to_level_filter())
        .parse_default_env()
        .init();

    match run(&cli, &config) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("{} {}", "[ERROR]".red().bold(), e);
            std::process::exit(e.downcast_ref::<UpiError>().map_or(1, UpiError::exit_code));
        }
    }
}

#[cfg(feature = "cli")]
fn run(cli: &Cli, config: &UpiConfig) -> Result<bool, Box<dyn std::error::Error>> {
    match &cli.command {
        Commands::Resolve {
            family,
            kind,
            port,
            io_die,
        } => {
            let path = registers::resolve(*kind, *family, *port, *io_die)?;
            match cli.format {
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::json!({ "family": family, "kind": kind, "port": port, "path": path })
                ),
                OutputFormat::Text => println!("{}", path),
            }
            Ok(true)
        }
        Commands::Detect => {
            let family = PlatformFamily::detect_local()?;
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::json!({ "family": family })),
                OutputFormat::Text => println!("{} {}", "Platform:".white().bold(), family.to_string().green()),
            }
            Ok(true)
        }
        Commands::Sockets { expect } => {
            let mut shell = LocalShell::new();
            let count = os_socket_count(&mut shell, Duration::from_secs(config.command_timeout_secs))?;
            let ok = count == *expect;
            match cli.format {
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::json!({ "expected": expect, "reported": count, "passed": ok })
                ),
                OutputFormat::Text => println!("{} {} (expected {})", verdict(ok), count, expect),
            }
            Ok(ok)
        }
        Commands::SampleConfig => {
            print!("{}", UpiConfig::sample_toml());
            Ok(true)
        }
        Commands::Simulate {
            driver,
            family,
            sockets,
            check,
            seed,
        } => {
            let family = family.or(config.platform).unwrap_or(PlatformFamily::SPR);
            let state = simulated_platform(family, *sockets, *seed);
            let outcome = simulate(config, &state, driver, *check, *seed)?;
            print_outcome(cli.format, &outcome)?;
            Ok(outcome.passed())
        }
    }
}

#[cfg(feature = "cli")]
fn simulated_platform(family: PlatformFamily, sockets: u32, seed: u64) -> SharedSim {
    match sockets {
        2 => SimState::two_socket(family),
        4 => SimState::four_socket_mesh(family),
        n => SimState::random_mesh(family, n, seed),
    }
}

#[cfg(feature = "cli")]
fn hours(h: f64) -> Duration {
    Duration::from_secs_f64(h.max(0.0) * 3600.0)
}

#[cfg(feature = "cli")]
fn simulate(
    config: &UpiConfig,
    state: &SharedSim,
    driver: &SimDriver,
    check: UpiCheck,
    seed: u64,
) -> Result<CampaignOutcome, Box<dyn std::error::Error>> {
    let settings = config.campaign_settings()?;
    let mut sut = simulated_sut(state);

    let driver = match driver {
        SimDriver::Stress { cycles } => Driver::Stress {
            workload: Workload::stressapp("Stressapp.log"),
            check,
            cycles: *cycles,
        },
        SimDriver::Resets {
            cycles,
            kind,
            hours: h,
            reset_minutes,
        } => {
            state
                .borrow_mut()
                .set_reset_duration(Duration::from_secs(reset_minutes * 60));
            Driver::Resets {
                check,
                kind: *kind,
                cycles: *cycles,
                budget: settings.budget(hours(*h))?,
            }
        }
        SimDriver::Idle { hours: h } => Driver::Idle {
            check,
            budget: settings.budget(hours(*h))?,
        },
        SimDriver::Bandwidth { hours: h } => Driver::Bandwidth {
            workload: Workload::mlc_loaded_latency(settings.stress_settle + hours(*h)),
            check,
            budget: settings.budget(hours(*h))?,
        },
        SimDriver::Degrade {
            ports,
            socket_count,
            mlc_cycles,
        } => {
            let plan = if ports.is_empty() {
                DegradationPlan::Random { ports_per_socket: 1 }
            } else {
                DegradationPlan::Explicit(ports.clone())
            };
            Driver::Degradation {
                plan,
                socket_count: *socket_count,
                mlc_cycles: *mlc_cycles,
            }
        }
        SimDriver::PackageC6 { minutes, poll_secs } => Driver::PackageC6 {
            check,
            budget: CycleBudget::new(Duration::from_secs(minutes * 60), Duration::from_secs(*poll_secs))?,
        },
        SimDriver::Stream { hours: h, stream_type } => Driver::Stream {
            check,
            stream_type: stream_type.clone(),
            budget: settings.budget(hours(*h))?,
        },
    };

    // Seeded so a random plan can be replayed.
    let case = TestCase::new("simulated", driver, settings)
        .with_telemetry(config.telemetry_sidecar())
        .with_seed(seed);
    Ok(case.run(&mut sut)?)
}

#[cfg(feature = "cli")]
fn verdict(ok: bool) -> colored::ColoredString {
    if ok {
        "PASS".green().bold()
    } else {
        "FAIL".red().bold()
    }
}

#[cfg(feature = "cli")]
fn print_outcome(format: OutputFormat, outcome: &CampaignOutcome) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(outcome)?),
        OutputFormat::Text => {
            println!("{} {}", "Result:".white().bold(), verdict(outcome.passed()));
            println!("  {} {}", "State:".white(), outcome.state.to_string().cyan());
            println!("  {} {}", "Cycles:".white(), outcome.cycles_completed);
            println!("  {} {}s", "Elapsed:".white(), outcome.elapsed_secs);
            if let Some(reason) = &outcome.failure {
                println!("  {} {}", "Failure:".white(), reason.to_string().red());
            }
        }
    }
    Ok(())
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("CLI features not enabled. Please compile with --features cli");
    std::process::exit(1);
}
