use anyhow::{Context, Result};
use clap::Parser;
use std::{fs, io};
use storage_verifier::{
    config::{self, Args, Command, MenuArgs, ServeConfig, VerifyArgs, VerifyConfig},
    emulator,
    models::session::Session,
    nav, verifier,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup (stderr; stdout carries the report) ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    match args.command.unwrap_or(Command::Verify(VerifyArgs::default())) {
        Command::Verify(args) => {
            let cfg = match VerifyConfig::resolve(args, config::process_env) {
                Ok(cfg) => cfg,
                Err(err) => {
                    eprintln!("configuration error: {err:#}");
                    std::process::exit(verifier::report::FailureKind::Configuration.exit_code());
                }
            };
            tracing::debug!("Starting verification with config: {:?}", cfg);

            let report = verifier::verify(&cfg).await;
            if cfg.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{report}");
            }
            std::process::exit(report.exit_code(cfg.strict));
        }
        Command::Serve(args) => {
            let cfg = ServeConfig::resolve(args, config::process_env)?;
            tracing::info!("Starting emulator with config: {:?}", cfg);
            emulator::serve(cfg).await
        }
        Command::Menu(args) => menu(args),
    }
}

/// Print the navigation for a stored session, or log it out.
fn menu(args: MenuArgs) -> Result<()> {
    let raw = fs::read_to_string(&args.session)
        .with_context(|| format!("reading session file {}", args.session.display()))?;
    let mut session: Session = serde_json::from_str(&raw)
        .with_context(|| format!("parsing session file {}", args.session.display()))?;

    if args.logout {
        let route = session.logout();
        fs::write(&args.session, serde_json::to_string_pretty(&session)?)
            .with_context(|| format!("writing session file {}", args.session.display()))?;
        println!("{route}");
        return Ok(());
    }

    match nav::render(&session) {
        Some(bar) => println!("{bar}"),
        None => println!("Not signed in."),
    }
    Ok(())
}
