//! `roamer` – command line entry point.
//!
//! - `roamer simulate` runs one autonomous session against the in-process
//!   simulated robot with the configured model. Ctrl-C cancels the session;
//!   the lease is still released.
//! - `roamer parse <text>` runs the command parser offline.
//! - `roamer commands` prints the command catalog shown to the model.
//! - `roamer config` shows the (redacted) configuration or writes defaults.

mod config;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;
use roamer_hal::{ActuatorCall, SimRobot};
use roamer_runtime::{CommandRegistry, DrainReason, PerceptionLoop, SessionReport};
use roamer_types::SensorEvent;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "roamer", version, about = "Autonomous perception-action loop for a small robot")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one session against the simulated robot.
    Simulate {
        /// Inject a touch spike this many seconds after control is acquired.
        #[arg(long, value_name = "SECS")]
        touch_after: Option<u64>,

        /// Override the iteration budget for this run.
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Override the model for this run.
        #[arg(long)]
        model: Option<String>,
    },
    /// Parse a model reply and print the resulting command.
    Parse { text: String },
    /// Print the command catalog.
    Commands,
    /// Show the configuration, or write a default one.
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration with secrets redacted.
    Show,
    /// Write a default config file if none exists.
    Init,
    /// Print the config file location.
    Path,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = roamer_runtime::init_tracing("roamer");

    let result = match cli.command {
        Command::Simulate {
            touch_after,
            max_iterations,
            model,
        } => simulate(touch_after, max_iterations, model),
        Command::Parse { text } => parse(&text),
        Command::Commands => {
            print_commands();
            Ok(())
        }
        Command::Config { action } => config_command(action.unwrap_or(ConfigAction::Show)),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// simulate
// ─────────────────────────────────────────────────────────────────────────────

fn simulate(
    touch_after: Option<u64>,
    max_iterations: Option<u32>,
    model: Option<String>,
) -> Result<(), String> {
    let mut cfg = config::load_or_default()?;
    if let Some(n) = max_iterations {
        cfg.autonomy.max_loop_iterations = n;
    }
    if let Some(m) = model {
        cfg.autonomy.model = m;
    }

    let robot = Arc::new(
        SimRobot::new(cfg.simulator.robot_id.clone())
            .with_actuator_delay(Duration::from_millis(cfg.simulator.actuator_delay_ms)),
    );
    let registry = Arc::new(CommandRegistry::builtin());
    let session = PerceptionLoop::from_settings(robot.clone(), &cfg.autonomy, registry)
        .map_err(|e| format!("configuration: {e}"))?;

    let cancel = CancellationToken::new();
    let on_ctrlc = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\n{}", "Ctrl-C received, stopping session …".yellow().bold());
        on_ctrlc.cancel();
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler");
    }

    println!(
        "  {} {} with {} ({} iterations max)",
        "Simulating".bold().cyan(),
        cfg.simulator.robot_id.bold(),
        cfg.autonomy.model.bold(),
        cfg.autonomy.max_loop_iterations
    );

    let runtime = tokio::runtime::Runtime::new().map_err(|e| format!("tokio runtime: {e}"))?;
    let report = runtime.block_on(async {
        if let Some(secs) = touch_after {
            let robot = robot.clone();
            tokio::spawn(async move {
                robot.wait_for_event_subscriber().await;
                tokio::time::sleep(Duration::from_secs(secs)).await;
                info!("injecting touch spike");
                robot.push_event(SensorEvent::touch(400));
                robot.push_event(SensorEvent::touch(900));
            });
        }
        session.run(cancel).await
    });

    print_report(&report, &robot);
    match report.reason {
        DrainReason::Fatal | DrainReason::ControlNotAcquired | DrainReason::ControlLost => {
            Err(format!("session ended: {:?}", report.reason))
        }
        _ => Ok(()),
    }
}

fn print_report(report: &SessionReport, robot: &SimRobot) {
    println!();
    println!("  {} {}", "Session".bold(), report.id.to_string().dimmed());
    println!("    reason      {:?}", report.reason);
    println!("    iterations  {}", report.iterations);
    println!("    commands    {}", report.commands_executed);
    if let Some(source) = &report.interrupt {
        println!("    interrupt   {source}");
    }
    if let Some(e) = &report.error {
        println!("    error       {}", e.to_string().red());
    }
    println!(
        "    released    {}",
        if report.released_cleanly { "yes".green() } else { "timed out".yellow() }
    );

    println!("\n  {}", "Actuator calls".bold());
    for call in robot.calls() {
        println!("    • {}", describe(&call));
    }
}

fn describe(call: &ActuatorCall) -> String {
    match call {
        ActuatorCall::SayText(text) => format!("say {text:?}"),
        ActuatorCall::PlayAnimation { name, .. } => format!("animation {name}"),
        other => format!("{other:?}"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// parse / commands
// ─────────────────────────────────────────────────────────────────────────────

fn parse(text: &str) -> Result<(), String> {
    let registry = CommandRegistry::builtin();
    let command = registry.parse(text).map_err(|e| e.to_string())?;
    println!("  {}", command.name.bold().green());
    if let Some(spec) = registry.get(&command.name) {
        for param in &spec.params {
            if let Some(value) = command.get(&param.name) {
                println!("    {} = {} ({})", param.name, value, value.param_type());
            }
        }
    }
    Ok(())
}

fn print_commands() {
    let registry = CommandRegistry::builtin();
    for spec in registry.iter() {
        let kind = if spec.action().is_some() { "" } else { "  [loop]" };
        println!("  {}{}", spec.signature().bold(), kind.dimmed());
        println!("      {}", spec.description);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// config
// ─────────────────────────────────────────────────────────────────────────────

fn config_command(action: ConfigAction) -> Result<(), String> {
    match action {
        ConfigAction::Show => {
            let cfg = config::load_or_default()?;
            println!("{:#?}", cfg);
            match cfg.autonomy.validate() {
                Ok(_) => println!("\n  {}", "✓ ready for autonomous sessions".green()),
                Err(e) => println!("\n  {} {}", "✗".red(), e),
            }
        }
        ConfigAction::Init => {
            if config::load()?.is_some() {
                println!("  Config already exists at {}", config::config_path().display());
            } else {
                config::save(&config::Config::default())?;
                println!(
                    "  {} Config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                );
            }
        }
        ConfigAction::Path => println!("{}", config::config_path().display()),
    }
    Ok(())
}
