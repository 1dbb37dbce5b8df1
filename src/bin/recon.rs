use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Result};
use clap::{CommandFactory, Parser, Subcommand};
use skincare_recon::cli;
use skincare_recon::schema::RecordTable;
use skincare_recon::util::{env, logging};
use tracing::{error, info};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "recon", version, about = "Skincare identity reconciliation and data-integrity audit")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Print exact row counts for every table, staging included
    Inventory {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Report which user_id references resolve to a profile and which are orphaned
    Audit {
        /// analyses, routines or user-roles (default: all)
        #[arg(long)]
        table: Option<RecordTable>,
        #[arg(long, default_value_t = false)]
        json: bool,
        /// Orphan groups listed per table
        #[arg(long, default_value_t = 20)]
        show: usize,
    },
    /// Validate a scanId;userId export file
    CsvAudit {
        file: PathBuf,
        /// Field delimiter (single byte)
        #[arg(long, default_value = ";")]
        delimiter: String,
        /// Resolve valid rows' userIds against profiles
        #[arg(long, default_value_t = false)]
        check_profiles: bool,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Build the reconciliation plan without writing anything
    Plan {
        #[command(flatten)]
        args: PlanArgs,
    },
    /// Build the plan and execute it
    Repair {
        #[command(flatten)]
        args: PlanArgs,
    },
    /// Look up profiles by email (ILIKE)
    FindProfile {
        #[arg(long)]
        email: String,
        #[arg(long, default_value_t = 20)]
        limit: u64,
    },
    /// Create a profile with a fixed id unless it already exists
    EnsureProfile {
        #[arg(long)]
        id: Uuid,
        #[arg(long)]
        email: String,
        #[arg(long)]
        display_name: Option<String>,
    },
    /// Print a redacted configuration snapshot and validate it
    CheckEnv {
        /// Also connect and count profiles
        #[arg(long, default_value_t = false)]
        connect: bool,
    },
}

#[derive(clap::Args, Debug)]
struct PlanArgs {
    /// analyses, routines or user-roles (default: all)
    #[arg(long)]
    table: Option<RecordTable>,
    /// OLD=NEW user id remap, repeatable
    #[arg(long = "remap")]
    remaps: Vec<String>,
    /// JSON object of old -> new user ids
    #[arg(long)]
    remap_file: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    json: bool,
}

impl PlanArgs {
    fn into_config(self, execute: bool) -> cli::repair::RepairConfig {
        cli::repair::RepairConfig {
            table: self.table,
            remaps: self.remaps,
            remap_file: self.remap_file,
            execute,
            json: self.json,
        }
    }
}

fn delimiter_byte(raw: &str) -> Result<u8> {
    match raw {
        "\\t" | "tab" => Ok(b'\t'),
        s if s.len() == 1 => Ok(s.as_bytes()[0]),
        other => bail!("delimiter must be a single byte, got {other:?}"),
    }
}

async fn dispatch(command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Inventory { json } => {
            cli::inventory::run(cli::inventory::InventoryConfig { json }).await?;
        }
        Commands::Audit { table, json, show } => {
            cli::audit::run(cli::audit::AuditConfig { table, json, show }).await?;
        }
        Commands::CsvAudit {
            file,
            delimiter,
            check_profiles,
            json,
        } => {
            let cfg = cli::csv_audit::CsvAuditConfig {
                path: file,
                delimiter: delimiter_byte(&delimiter)?,
                check_profiles,
                json,
            };
            cli::csv_audit::run(cfg).await?;
        }
        Commands::Plan { args } => {
            cli::repair::run(args.into_config(false)).await?;
        }
        Commands::Repair { args } => {
            let summary = cli::repair::run(args.into_config(true)).await?;
            info!(
                succeeded = summary.succeeded,
                failed = summary.failed,
                flagged = summary.flagged,
                partial = summary.partial_promotions,
                "repair: completed"
            );
            if summary.partial_promotions > 0 {
                error!(
                    count = summary.partial_promotions,
                    "repair: staging rows were copied but not removed; see report"
                );
                return Ok(ExitCode::from(2));
            }
        }
        Commands::FindProfile { email, limit } => {
            cli::profiles::run_find(cli::profiles::FindProfileConfig { email, limit }).await?;
        }
        Commands::EnsureProfile {
            id,
            email,
            display_name,
        } => {
            let cfg = cli::profiles::EnsureProfileConfig {
                id,
                email,
                display_name,
            };
            cli::profiles::run_ensure(cfg).await?;
        }
        Commands::CheckEnv { connect } => {
            cli::check_env::run(cli::check_env::CheckEnvConfig { connect }).await?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = logging::init_cli("recon", "info,sqlx=warn");

    if env::env_flag("RECON_LIST_SUBCOMMANDS", false) {
        let names: Vec<String> = Cli::command()
            .get_subcommands()
            .map(|cmd| cmd.get_name().to_string())
            .collect();
        eprintln!("available subcommands: {:?}", names);
        return ExitCode::SUCCESS;
    }

    let cli = Cli::parse();
    match dispatch(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = ?e, "recon: aborted");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
