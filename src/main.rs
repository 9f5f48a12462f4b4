use cfgsync::{DatabaseHandle, ProductKey, RemoteRegistry, SettingsEngineConfig, Value};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "settings-cli")]
#[command(about = "cfgsync demo harness", long_about = None)]
struct Cli {
    /// Directory holding the local database (defaults to the config's database_root)
    #[arg(long)]
    dir: Option<PathBuf>,
    /// Path to a cfgsync.toml config file
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or open a local database and select a product
    Init {
        name: String,
        version: String,
        public_key: String,
    },
    /// Write a string value under the currently selected product
    Set { name: String, value: String },
    /// Read a value back as a string
    Get { name: String },
    /// Run the sync engine against a remembered remote
    Sync { friendly_name: String },
    /// Remember a remote database by path
    RememberRemote {
        friendly_name: String,
        path: PathBuf,
        #[arg(long, default_value_t = true)]
        sync_by_default: bool,
    },
    /// List every product registered in the local database
    EnumProducts,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let cli = Cli::parse();
    let config = SettingsEngineConfig::load(cli.config.as_deref())?;
    let dir = cli.dir.unwrap_or(config.database_root);

    let handle = DatabaseHandle::init(dir, false, config.codec_threshold_bytes)?;

    match cli.command {
        Commands::Init { name, version, public_key } => {
            let key = ProductKey::validate(&name, &version, &public_key)?;
            let app_id = handle.set_product(&key)?;
            println!("selected product {name} {version} as app_id {app_id}");
        }
        Commands::Set { name, value } => {
            handle.set_string(&name, value)?;
            println!("set {name}");
        }
        Commands::Get { name } => match handle.get_value(&name)? {
            Value::String(s) => println!("{s}"),
            other => println!("{other:?}"),
        },
        Commands::Sync { friendly_name } => {
            let Some(row) = RemoteRegistry::find(&handle, &friendly_name)? else {
                anyhow::bail!("no remembered remote named {friendly_name}");
            };
            let remote = DatabaseHandle::init(row.path.clone(), true, config.codec_threshold_bytes)?;
            let conflicts = cfgsync::sync::sync_all_products(&handle, &remote)?;
            if conflicts.is_empty() {
                println!("sync clean, no conflicts");
            } else {
                for product in &conflicts {
                    for value in &product.values {
                        println!("conflict: {} / {}", product.product.name, value.name);
                    }
                }
            }
        }
        Commands::RememberRemote { friendly_name, path, sync_by_default } => {
            RemoteRegistry::remember(&handle, &friendly_name, path, sync_by_default)?;
            println!("remembered {friendly_name}");
        }
        Commands::EnumProducts => {
            for row in handle.enumerate_products()? {
                println!("{} {} {} (registered={})", row.key.name, row.key.version, row.key.public_key, row.registered);
            }
        }
    }

    Ok(())
}
