//! VenueLens Operator Console
//!
//! Manual overrides for support staff. Results are printed as JSON on
//! stdout, logs go to stderr. Exit codes: 0 success, 1 user or product not
//! found, 2 counter store unavailable, 3 any other failure.

use std::process;

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;
use venuelens_billing::{MeteringService, OperatorConsole, OperatorResult};
use venuelens_shared::{connect_counter_store, create_pool, CounterStoreConfig};

#[derive(Parser, Debug)]
#[command(name = "venuelens-admin", about = "VenueLens metering operator console")]
struct Cli {
    /// Name recorded in audit logs
    #[arg(long, env = "ADMIN_ACTOR", default_value = "cli")]
    actor: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Set the credits a user has left this period
    SetRemaining { user_id: Uuid, remaining: i64 },
    /// Grant credits (negative to take them away)
    Add {
        user_id: Uuid,
        #[arg(allow_hyphen_values = true)]
        delta: i64,
    },
    /// Reset usage back to the plan limit
    Reset { user_id: Uuid },
    /// Replenish a yearly subscriber now and record it in the reset ledger
    ForceYearlyReset { user_id: Uuid },
    /// Print the mirrored subscription and usage
    Show { user_id: Uuid },
    /// Set a product's monthly credit allowance
    SetAllowance { product_id: String, credits: i64 },
    /// Pull active products and recurring prices from the billing provider
    SyncCatalog,
    /// Refresh a user's subscription from the billing provider
    SyncSubscription { user_id: Uuid },
    /// Attach a billing-provider customer to a user
    LinkCustomer { user_id: Uuid, customer_id: String },
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(out) => println!("{}", out),
        Err(e) => eprintln!("Failed to render output: {}", e),
    }
}

async fn run(console: &OperatorConsole, command: Command) -> OperatorResult<()> {
    match command {
        Command::SetRemaining { user_id, remaining } => {
            print_json(&console.set_remaining(user_id, remaining).await?)
        }
        Command::Add { user_id, delta } => print_json(&console.add(user_id, delta).await?),
        Command::Reset { user_id } => print_json(&console.reset_to_limit(user_id).await?),
        Command::ForceYearlyReset { user_id } => {
            print_json(&console.force_yearly_reset(user_id).await?)
        }
        Command::Show { user_id } => print_json(&console.show(user_id).await?),
        Command::SetAllowance {
            product_id,
            credits,
        } => {
            console.set_allowance(&product_id, credits).await?;
            print_json(&json!({ "product_id": product_id, "credits": credits }));
        }
        Command::SyncCatalog => print_json(&console.sync_catalog().await?),
        Command::SyncSubscription { user_id } => {
            print_json(&console.sync_subscription(user_id).await?)
        }
        Command::LinkCustomer {
            user_id,
            customer_id,
        } => print_json(&console.link_customer(user_id, &customer_id).await?),
    }
    Ok(())
}

/// Connect everything the console needs
async fn connect() -> Result<MeteringService, (i32, String)> {
    let database_url =
        std::env::var("DATABASE_URL").map_err(|_| (3, "DATABASE_URL must be set".to_string()))?;
    let pool = create_pool(&database_url)
        .await
        .map_err(|e| (3, format!("Database unavailable: {}", e)))?;

    let counter_config = CounterStoreConfig::from_env().map_err(|e| (3, e.to_string()))?;
    let counter = connect_counter_store(&counter_config)
        .await
        .map_err(|e| (2, format!("Counter store unavailable: {}", e)))?;

    MeteringService::from_env(pool, counter).map_err(|e| (3, e.to_string()))
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let metering = match connect().await {
        Ok(metering) => metering,
        Err((code, message)) => {
            eprintln!("error: {}", message);
            process::exit(code);
        }
    };

    let console = metering.operator.as_actor(cli.actor);
    if let Err(err) = run(&console, cli.command).await {
        eprintln!("error: {}", err);
        process::exit(err.exit_code());
    }
}
