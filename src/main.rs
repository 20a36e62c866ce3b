use anyhow::Result;
use clap::Parser;
use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use warden::cli::{Cli, Commands};
use warden::config::AppConfig;
use warden::credentials::EnvCredentials;
use warden::runtime::ClaudeCliRuntime;
use warden::session::{QueryOptions, QueryOutcome, SessionManager};
use warden::state::VersionStore;
use warden::utility::TitleGenerator;
use warden::versions::{
    BinaryLocator, DownloadProgress, HttpDistribution, VersionActivator, VersionDiscovery,
    VersionDownloader,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("warden=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::from_env()?;
    if let Some(dir) = cli.data_dir {
        config = config.with_data_dir(dir);
    }
    std::fs::create_dir_all(&config.data_dir)?;

    let store = Arc::new(VersionStore::open(
        config.registry_path(),
        warden::platform::host_key(),
    )?);
    let distribution = Arc::new(HttpDistribution::new(&config)?);
    let locator = Arc::new(BinaryLocator::new(
        Arc::clone(&store),
        config.bundled_binary_path.clone(),
    ));
    let session = Arc::new(SessionManager::new(
        Arc::new(ClaudeCliRuntime::new()),
        Arc::new(EnvCredentials::default()),
        Arc::clone(&locator),
        &config,
    ));
    let activator = VersionActivator::new(
        Arc::clone(&store),
        Arc::clone(&locator),
        Arc::clone(&session),
        config.versions_dir(),
    );

    match cli.command {
        Commands::Versions { refresh } => {
            let discovery = VersionDiscovery::new(distribution, &config);
            if refresh {
                discovery.clear_version_cache().await;
            }
            let versions = discovery.list_versions(&store).await?;
            if versions.is_empty() {
                println!("No runtime versions found.");
            }
            for version in versions {
                let marker = if version.is_active() { "*" } else { " " };
                let status = match &version.installed {
                    Some(record) if record.is_bundled => "bundled",
                    Some(_) if version.is_installed() => "installed",
                    Some(_) => "missing",
                    None => "available",
                };
                println!("{} {:<10} {}", marker, version.id, status);
            }
        }

        Commands::Download { version, activate } => {
            let downloader =
                VersionDownloader::new(distribution, Arc::clone(&store), config.versions_dir());
            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_interrupt.cancel();
                }
            });

            let path = downloader
                .download_version(&version, print_progress, &cancel)
                .await?;
            println!("  Binary:   {}", path.display());

            if activate {
                activator.activate_version(&version).await?;
                println!("Activated {}", version);
            }
        }

        Commands::Activate { version } => {
            activator.activate_version(&version).await?;
            println!("Activated {}", version);
        }

        Commands::ResetBundled => {
            let version = activator.reset_to_bundled().await?;
            println!("Using bundled runtime {}", version);
        }

        Commands::Delete { version } => {
            activator.delete_version(&version).await?;
            println!("Deleted {}", version);
        }

        Commands::Path => {
            println!("{}", locator.active_binary_path().display());
        }

        Commands::Title { message } => {
            session.init(None).await;
            let generator = TitleGenerator::new(Arc::clone(&session), &config);
            println!("{}", generator.generate_title(&message).await);
        }

        Commands::Ask { prompt, model } => {
            let state = session.init(None).await;
            if let Some(error) = &state.error_message {
                eprintln!("Background session failed to start: {}", error);
            }
            let options = QueryOptions {
                model,
                ..Default::default()
            };
            let answer = answer_text(session.query(&prompt, options).await);
            if answer.is_err() {
                session.shutdown().await;
            }
            println!("{}", answer?);
        }
    }

    session.shutdown().await;
    Ok(())
}

/// A failed query becomes the command's error so the exit status reflects it.
fn answer_text(outcome: QueryOutcome) -> Result<String> {
    if outcome.success {
        Ok(outcome.text)
    } else {
        anyhow::bail!(
            "query failed: {}",
            outcome.error.as_deref().unwrap_or("unknown error")
        )
    }
}

fn print_progress(event: DownloadProgress) {
    match event {
        DownloadProgress::Progress {
            percent,
            bytes_downloaded,
            total_bytes,
        } => {
            print!("\r  {:>3}% ({}/{} bytes)", percent, bytes_downloaded, total_bytes);
            let _ = std::io::stdout().flush();
        }
        DownloadProgress::Verifying { message } => println!("\n  {}", message),
        DownloadProgress::Complete { message } => println!("{}", message),
        DownloadProgress::Error { message } => eprintln!("\nError: {}", message),
    }
}
