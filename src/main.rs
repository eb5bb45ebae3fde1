mod args;

use args::{Cli, Commands};
use clap::{CommandFactory, Parser};
use goma_ctl::{platform, CtlConfig, CtlError, Driver, HttpSource};
use tracing_subscriber::{fmt, EnvFilter};

/// Log filter for this tool; kept out of the `GOMA_` namespace the daemon reads.
const LOG_ENV: &str = "GOMACTL_LOG";

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let _ = fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .try_init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            if e.use_stderr() {
                println!();
                let _ = Cli::command().print_help();
            }
            return Ok(());
        }
    };

    if let Err(e) = run(cli.command.unwrap_or(Commands::Status)).await {
        tracing::error!(slug = e.slug(), "goma_ctl failed");
        return Err(e.into());
    }
    Ok(())
}

async fn run(command: Commands) -> Result<(), CtlError> {
    let platform = platform::detect();
    let config = CtlConfig::from_env(platform.as_ref())?;
    let source = HttpSource::new(&config)?;
    let mut driver = Driver::new(config, platform, Box::new(source))?;
    driver.prepare_directories()?;

    match command {
        Commands::Start => driver.start(false).await?,
        Commands::Stop => driver.stop().await?,
        Commands::Restart => driver.restart().await?,
        Commands::EnsureStart => driver.start(true).await?,
        Commands::Pull => driver.pull().await?,
        Commands::Update => driver.update().await?,
        Commands::Status => {
            driver.status().await?;
        }
        Commands::Stat => driver.stat().await?,
        Commands::Histogram => driver.histogram().await?,
        Commands::Jsonstatus { outfile } => {
            let status = driver.json_status().await?;
            match outfile {
                Some(path) => std::fs::write(path, status)?,
                None => println!("{}", status),
            }
        }
        Commands::LatestVersion => driver.print_latest_version().await?,
        Commands::Fetch { platform, outfile } => {
            driver.fetch_package(&platform, outfile.as_deref()).await?;
        }
        Commands::Report => {
            driver.report().await?;
        }
        Commands::Audit => {
            driver.audit()?;
        }
    }
    Ok(())
}
