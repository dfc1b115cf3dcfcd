//! mailgram: watch an IMAP mailbox and forward new mail to a Telegram chat.

use clap::Parser;
use mailgram::config::Config;
use mailgram::dispatch::Dispatcher;
use mailgram::forwarder::{self, MailWorker};
use mailgram::session::TlsMailConnector;
use mailgram::telegram::TelegramTransport;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "mailgram",
    version,
    about = "Forward incoming IMAP mail to a Telegram chat"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Process mail received before the application was started.
    #[arg(short = 'o', long)]
    read_old_mails: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;
    if cli.read_old_mails {
        config.mail.read_old_mails = true;
    }

    let connector = TlsMailConnector::new(
        config.mail.server.clone(),
        config.mail.port,
        config.mail.user.clone(),
        config.mail.password.clone(),
        Duration::from_secs(config.mail.timeout_secs),
    );
    let worker = MailWorker::new(connector, config.mail.clone());
    let transport = TelegramTransport::new(&config.telegram);
    let dispatcher = Dispatcher::new(transport, config.telegram.clone());

    tracing::info!(
        server = %config.mail.server,
        folder = %config.mail.folder,
        "starting mail forwarder"
    );
    forwarder::run(worker, dispatcher, config).await?;
    Ok(())
}
