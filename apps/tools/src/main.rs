use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use server_api::{token::SessionKeys, Session};
use shared::{
    domain::{Delivery, Role, UserId},
    protocol::DeliveryFilter,
};
use storage::{ApprovalScope, Storage};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Operator commands against the delivery database.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/deliveries.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Registers a user, or renames an existing one with the same email.
    CreateUser {
        name: String,
        email: String,
        #[arg(long, default_value = "pending")]
        role: String,
    },
    SetRole {
        user_id: i64,
        role: String,
    },
    ListDeliveries {
        #[arg(long, value_enum, default_value_t = ViewArg::All)]
        view: ViewArg,
    },
    /// Approves every delivery with the given order numbers, whatever its status.
    Approve {
        #[arg(required = true)]
        order_numbers: Vec<String>,
    },
    /// Prints a bearer token for the user's current role.
    MintToken {
        user_id: i64,
        /// Defaults to SESSION_SECRET from the environment.
        #[arg(long)]
        secret: Option<String>,
        #[arg(long, default_value_t = 12 * 3600)]
        ttl_seconds: i64,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ViewArg {
    All,
    Pending,
    PendingApproval,
    History,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::CreateUser { name, email, role } => {
            let role: Role = role.parse()?;
            let user_id = storage.create_user(&name, &email, role).await?;
            println!("created user_id={}", user_id.0);
        }
        Command::SetRole { user_id, role } => {
            let role: Role = role.parse()?;
            if !storage.update_user_role(UserId(user_id), role).await? {
                bail!("no user with id {user_id}");
            }
            info!(user_id, %role, "role updated");
            println!("user_id={user_id} role={role}");
        }
        Command::ListDeliveries { view } => {
            let all = storage.list_deliveries(&DeliveryFilter::default()).await?;
            let selected: Vec<&Delivery> = match view {
                ViewArg::All => all.iter().collect(),
                ViewArg::Pending => lifecycle::pending_deliveries(&all),
                ViewArg::PendingApproval => lifecycle::pending_approvals(&all),
                ViewArg::History => lifecycle::history(&all),
            };
            println!("{}", serde_json::to_string_pretty(&selected)?);
        }
        Command::Approve { order_numbers } => {
            let approved = storage
                .approve_deliveries(&order_numbers, ApprovalScope::Any)
                .await?;
            println!("approved {approved} deliveries");
        }
        Command::MintToken {
            user_id,
            secret,
            ttl_seconds,
        } => {
            let secret = match secret {
                Some(secret) => secret,
                None => std::env::var("SESSION_SECRET")
                    .context("pass --secret or set SESSION_SECRET")?,
            };
            let user = storage
                .get_user(UserId(user_id))
                .await?
                .with_context(|| format!("no user with id {user_id}"))?;
            let token = SessionKeys::new(&secret, ttl_seconds).mint(Session {
                user_id: user.id,
                role: user.role,
            })?;
            println!("{token}");
        }
    }

    Ok(())
}
