mod cli;

use clap::Parser;
use cli::{Cli, Commands, MainCommands};
use roost::{
    Config, Error, GitProvisioner, InstanceManager, InstanceRecord, InstanceSpec, InstanceUpdate,
    MainProcessManager, ProcessSupervisor, Provisioner, SqliteInstanceStore,
};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        if let Some(roost_error) = e.downcast_ref::<Error>() {
            eprintln!("Error: {}", roost_error);
            std::process::exit(exit_code(roost_error));
        }
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Distinct exit code per error kind, so scripts can react to the category
/// rather than parsing free text.
fn exit_code(error: &Error) -> i32 {
    match error {
        Error::AlreadyExists(_) => 3,
        Error::NotFound(_) => 4,
        Error::VersionNotFound(_) => 5,
        Error::InvalidStatus(_) => 6,
        Error::NonFastForward(_) => 7,
        Error::CloneFailed(_) | Error::ListFailed(_) => 8,
        _ => 1,
    }
}

async fn run() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir()?,
    };
    let config = Config::load(root)?;

    let supervisor: Arc<ProcessSupervisor> =
        Arc::new(ProcessSupervisor::new(config.base_env.clone()));

    // Branch listing needs no store; handle it before opening one.
    if let Commands::Branches { source } = &cli.command {
        let provisioner = GitProvisioner::new();
        for branch in provisioner.list_remote_branches(source)? {
            println!("{branch}");
        }
        return Ok(());
    }

    if let Commands::Main(main_cmd) = &cli.command {
        let main = MainProcessManager::new(&config, supervisor);
        let (status, json) = match main_cmd {
            MainCommands::Start => (main.start().await?, false),
            MainCommands::Stop => (main.stop().await?, false),
            MainCommands::Status { json } => (main.status().await?, *json),
        };
        if json {
            println!("{}", serde_json::to_string_pretty(&status)?);
        } else if status.running {
            println!("main: running (pid {})", status.pid.unwrap_or(0));
        } else {
            println!("main: stopped");
        }
        return Ok(());
    }

    let store = Arc::new(SqliteInstanceStore::open(&config.data_dir).await?);
    let manager = InstanceManager::new(config, store, supervisor, Arc::new(GitProvisioner::new()));

    match cli.command {
        Commands::Create {
            name,
            source,
            version,
            port,
            owner,
        } => {
            let record = manager
                .create(InstanceSpec {
                    name,
                    source,
                    version,
                    port,
                    owner,
                })
                .await?;
            print_record(&record);
        }
        Commands::Start { name } => print_record(&manager.start(&name).await?),
        Commands::Stop { name } => print_record(&manager.stop(&name).await?),
        Commands::Update {
            name,
            status,
            version,
            port,
        } => {
            let record = manager
                .update(
                    &name,
                    InstanceUpdate {
                        status,
                        version,
                        port,
                    },
                )
                .await?;
            print_record(&record);
        }
        Commands::Delete { name } => {
            manager.delete(&name).await?;
            println!("{name}: deleted");
        }
        Commands::List { json } => {
            let records = manager.list().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                for record in &records {
                    print_record(record);
                }
            }
        }
        Commands::Resume => {
            for record in manager.resume().await? {
                print_record(&record);
            }
        }
        Commands::Branches { .. } | Commands::Main(_) => unreachable!("handled above"),
    }

    Ok(())
}

fn print_record(record: &InstanceRecord) {
    let pid = record
        .pid
        .map(|p| p.to_string())
        .unwrap_or_else(|| "-".to_string());
    let version = record.version.as_deref().unwrap_or("-");
    let port = record
        .port
        .map(|p| p.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{:<20} {:<8} pid={:<8} version={:<12} port={}",
        record.name, record.status, pid, version, port
    );
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
}
