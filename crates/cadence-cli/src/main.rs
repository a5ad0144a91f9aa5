//! `cadence-cli` – demo executable
//!
//! 1. Loads `~/.cadence/config.toml`, writing the defaults on first run.
//! 2. Starts a simulated standalone executor on the configured channel,
//!    paced or bursting.
//! 3. Drives every actuator to a target through a `FrontEnd` and prints the
//!    resulting observation.
//! 4. Intercepts **Ctrl-C** to stop the executor cleanly.

mod config;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cadence_channel::SharedMemory;
use cadence_control::Scalar;
use cadence_control::interpolation::iterations_for;
use cadence_runtime::frequency::period_of;
use cadence_runtime::{FrontEnd, SimDriver, SimTelemetry, init_tracing, please_stop, start_standalone};
use cadence_types::{CadenceError, Mode, Observation, Timing};
use colored::Colorize;
use tracing::{info, warn};

#[tokio::main]
async fn main() {
    let _guard = init_tracing("cadence");

    print_banner();

    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!("  Config loaded from {}", config::config_path().display().to_string().bold());
            cfg
        }
        Ok(None) => {
            let cfg = config::Config::default();
            let path = config::config_path();
            match config::save_to(&cfg, &path) {
                Ok(()) => println!("  {} Default config written to {}", "✓".green().bold(), path.display().to_string().bold()),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };

    let memory = SharedMemory::new();
    let driver = SimDriver::<Scalar>::new(cfg.nb_actuators, 0.5);
    let mut handle = match start_standalone(&memory, &cfg.channel, driver, cfg.standalone()) {
        Ok(handle) => handle,
        Err(e) => {
            println!("{}: {}", "Cannot start executor".red(), e);
            std::process::exit(1);
        }
    };
    println!(
        "  Executor on {} ({} actuators, {})",
        cfg.channel.bold(),
        cfg.nb_actuators,
        if cfg.bursting { "bursting".to_string() } else { format!("{} Hz", cfg.frequency_hz) }
    );

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    let stop_memory = memory.clone();
    let stop_channel = cfg.channel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping the executor …".yellow().bold());
        please_stop(&stop_memory, &stop_channel);
        flag.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler");
    }

    let timeout = Duration::from_millis(cfg.wait_timeout_ms);
    let demo_memory = memory.clone();
    let demo_cfg = cfg.clone();
    let demo = tokio::task::spawn_blocking(move || run_demo(&demo_memory, &demo_cfg));

    let outcome = match tokio::time::timeout(timeout, demo).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(CadenceError::Protocol(format!("demo task failed: {e}"))),
        Err(_) => Err(CadenceError::Protocol(format!("no result within {} ms", cfg.wait_timeout_ms))),
    };

    match &outcome {
        Ok(observation) => print_observation(observation),
        Err(e) if interrupted.load(Ordering::SeqCst) => println!("  Demo interrupted: {}", e.to_string().dimmed()),
        Err(e) => println!("{}: {}", "Demo failed".red(), e),
    }

    if let Err(e) = handle.stop() {
        println!("{}: {}", "Executor error".red(), e);
    }
    info!(channel = %cfg.channel, "executor stopped");
    println!("{}", "  ✓ Exiting cadence.".green());

    // A demo still blocked in a wait cannot be cancelled.
    if outcome.is_err() {
        std::process::exit(1);
    }
}

/// Send every actuator to its target and return the observation of the
/// iteration on which the motion is done.
fn run_demo(memory: &SharedMemory, cfg: &config::Config) -> Result<Observation<Scalar, SimTelemetry>, CadenceError> {
    let mut front = FrontEnd::<Scalar, SimTelemetry>::new(memory, &cfg.channel)?;
    let duration = Duration::from_millis(cfg.demo_duration_ms);

    if cfg.bursting {
        let period = period_of(cfg.frequency_hz)?;
        let iterations = iterations_for(duration.as_micros() as f64, period.as_micros() as i64);
        for dof in 0..cfg.nb_actuators {
            let target = Scalar(cfg.demo_target * (dof + 1) as f64);
            front.add_command(dof, target, Timing::relative_iteration(iterations, true), Mode::Queue)?;
        }
        // commands start on the first iteration of the burst
        front.burst(iterations + 1)
    } else {
        for dof in 0..cfg.nb_actuators {
            let target = Scalar(cfg.demo_target * (dof + 1) as f64);
            front.add_command(dof, target, Timing::duration(duration), Mode::Queue)?;
        }
        front.pulse_and_wait()
    }
}

fn print_observation(observation: &Observation<Scalar, SimTelemetry>) {
    println!();
    println!(
        "  {} iteration {} ({:.1} Hz, {} driver steps)",
        "Done at".bold(),
        observation.control_iteration(),
        observation.measured_frequency(),
        observation.extended_state().steps
    );
    for (dof, (desired, measured)) in observation
        .desired_states()
        .iter()
        .zip(observation.measured_states())
        .enumerate()
    {
        println!("    dof {dof}: desired {:>8.3}  measured {:>8.3}", desired.0, measured.0);
    }
    println!();
}

fn print_banner() {
    println!();
    println!("{}", r#"   _________ _____/ /__  ____  ________ "#.bold().cyan());
    println!("{}", r#"  / ___/ __ `/ __  / _ \/ __ \/ ___/ _ \"#.bold().cyan());
    println!("{}", r#" / /__/ /_/ / /_/ /  __/ / / / /__/  __/"#.bold().cyan());
    println!("{}", r#" \___/\__,_/\__,_/\___/_/ /_/\___/\___/ "#.bold().cyan());
    println!();
    println!("  {} {}", "cadence".bold(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Real-time command and observation exchange");
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_config(channel: &str, bursting: bool) -> config::Config {
        config::Config {
            channel: channel.to_string(),
            bursting,
            demo_target: 2.0,
            demo_duration_ms: 30,
            ..config::Config::default()
        }
    }

    #[test]
    fn bursting_demo_reaches_targets() -> Result<(), Box<dyn std::error::Error>> {
        let cfg = demo_config("demo-burst", true);
        let memory = SharedMemory::new();
        let mut handle = start_standalone(&memory, &cfg.channel, SimDriver::<Scalar>::new(2, 0.5), cfg.standalone())?;

        let observation = run_demo(&memory, &cfg)?;
        assert_eq!(observation.control_iteration(), 31);
        assert_eq!(observation.desired_states(), &[Scalar(2.0), Scalar(4.0)]);
        handle.stop()?;
        Ok(())
    }

    #[test]
    fn paced_demo_reaches_targets() -> Result<(), Box<dyn std::error::Error>> {
        let cfg = demo_config("demo-paced", false);
        let memory = SharedMemory::new();
        let mut handle = start_standalone(&memory, &cfg.channel, SimDriver::<Scalar>::new(2, 0.5), cfg.standalone())?;

        let observation = run_demo(&memory, &cfg)?;
        assert_eq!(observation.desired_states(), &[Scalar(2.0), Scalar(4.0)]);
        handle.stop()?;
        Ok(())
    }

    #[test]
    fn demo_needs_a_running_executor() {
        let cfg = demo_config("demo-none", false);
        let memory = SharedMemory::new();
        assert!(matches!(run_demo(&memory, &cfg), Err(CadenceError::ChannelNotFound(_))));
    }
}
