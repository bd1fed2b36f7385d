//! Standalone disaster-recovery tool.
//!
//! Usage: `vaultline-recover [--target-dir DIR] [--uploads-dir DIR]`

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use vaultline::errors::AppError;
use vaultline::recovery::{self, PsqlLoader, RecoveryOptions, console};

#[tokio::main]
async fn main() -> ExitCode {
    match run_app().await {
        Ok(summary) => {
            println!("✅ Restored {}.", summary.archive_key);
            ExitCode::SUCCESS
        }
        Err(e) => {
            // Operator mistakes get the short message; everything else the full chain.
            match e.downcast_ref::<AppError>() {
                Some(op @ (AppError::Cancelled(_) | AppError::InvalidInput(_) | AppError::Config(_))) => {
                    eprintln!("❌ {}", op)
                }
                _ => eprintln!("❌ Error: {:?}", e),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<recovery::RecoverySummary> {
    let options = parse_args(env::args().skip(1))?;
    println!("🛟 Vaultline disaster recovery");
    println!("Target directory: {}", options.target_dir.display());
    println!("Uploads directory: {}", options.uploads_dir.display());

    let mut console = console::stdio();
    recovery::run_interactive(&mut console, &options, &PsqlLoader).await
}

fn parse_args(args: impl Iterator<Item = String>) -> Result<RecoveryOptions> {
    let mut target_dir = env::current_dir().context("Failed to read current directory")?;
    let mut uploads_dir: Option<PathBuf> = None;
    let mut args = args;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--target-dir" => {
                target_dir = PathBuf::from(args.next().context("--target-dir needs a value")?)
            }
            "--uploads-dir" => {
                uploads_dir = Some(PathBuf::from(args.next().context("--uploads-dir needs a value")?))
            }
            other => anyhow::bail!("Unknown argument '{}'", other),
        }
    }
    let uploads_dir = uploads_dir.unwrap_or_else(|| target_dir.join("uploads"));
    Ok(RecoveryOptions {
        target_dir,
        uploads_dir,
    })
}
