use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flow_sdk::{
    AccountRequest, DeviceRequest, Flow, FlowConfig, HandlerError, NotificationKind, StopFlag,
    DEFAULT_DRAIN_TIMEOUT,
};
use serde_json::Value;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

/// Gives the backend time to persist a freshly installed account.
const INSTALL_SETTLE: Duration = Duration::from_secs(2);
const MEMBER: &str = "m";
const BOT_DEVICE: &str = "bot-device";

#[derive(Parser, Debug)]
#[command(name = "flow-bot", about = "Bots for the Flow messaging backend", version)]
struct Cli {
    /// Config file; defaults to the platform config directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Echo every message from other accounts back to its channel.
    Echo,
    /// Accept join requests for a team and add the requester to all its channels.
    AutoJoin { team_id: String },
    /// Install an account on this host, creating it if needed.
    Install { username: String, password: String },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => FlowConfig::default_path()?,
    };
    let config = FlowConfig::load_or_default(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let flow = Flow::launch(config).context("failed to start the flow backend")?;

    let outcome = match cli.command {
        Command::Echo => echo(&flow),
        Command::AutoJoin { team_id } => auto_join(&flow, team_id),
        Command::Install { username, password } => install(&flow, &username, &password),
    };
    if let Err(err) = flow.terminate() {
        log::warn!("backend shutdown: {err}");
    }
    outcome
}

fn echo(flow: &Flow) -> Result<()> {
    flow.start_up(None, None).context("failed to start the local account")?;
    let own_account = flow.account_id(None)?;

    let replier = flow.downgrade();
    flow.on(NotificationKind::Message, move |_: &str, data: &Value| {
        let Some(messages) = data["regularMessages"].as_array() else {
            return Ok(());
        };
        let replier = replier.get()?;
        for message in messages {
            let sender = field(message, "senderAccountId")?;
            if sender == own_account {
                continue;
            }
            let channel_id = field(message, "channelId")?;
            let channel = replier.get_channel(channel_id, None)?;
            let org_id = field(&channel, "orgId")?;
            let text = field(message, "text")?;
            replier.send_message(org_id, channel_id, &format!("echo: {text}"), None, None, None)?;

            let peer = replier.get_peer_from_id(sender, None)?;
            let username = peer["username"].as_str().unwrap_or(sender);
            println!("* msg '{text}' echoed back to '{username}'");
        }
        Ok(())
    })?;

    println!("Listening for incoming messages... (press Ctrl-C to stop)");
    drain_forever(flow)
}

fn auto_join(flow: &Flow, team_id: String) -> Result<()> {
    flow.start_up(None, None).context("failed to start the local account")?;

    let admin = flow.downgrade();
    flow.on(NotificationKind::OrgJoinRequest, move |_: &str, data: &Value| {
        let requests = data.as_array().map(Vec::as_slice).unwrap_or_default();
        let admin = admin.get()?;
        for request in requests {
            if field(request, "orgId")? != team_id {
                continue;
            }
            let account_id = field(request, "accountId")?;
            let peer = admin.get_peer_from_id(account_id, None)?;
            let username = peer["username"].as_str().unwrap_or(account_id);

            admin.org_add_member(&team_id, account_id, MEMBER, None)?;
            println!("* user '{username}' added to team.");
            let channels = admin.enumerate_channels(&team_id, None)?;
            for channel in channels.as_array().map(Vec::as_slice).unwrap_or_default() {
                let channel_id = field(channel, "id")?;
                admin.channel_add_member(&team_id, channel_id, account_id, MEMBER, None)?;
                let name = channel["name"].as_str().unwrap_or("?");
                println!("  - also added to channel '{name}'.");
            }
        }
        Ok(())
    })?;

    println!("Listening for incoming team join requests... (press Ctrl-C to stop)");
    drain_forever(flow)
}

fn install(flow: &Flow, username: &str, password: &str) -> Result<()> {
    println!("* Checking if account is already installed...");
    match flow.start_up(Some(username), None) {
        Ok(()) => {
            println!("* Account already installed.");
            return Ok(());
        }
        Err(err) => log::debug!("start up failed: {err}"),
    }

    println!("* Account not installed, trying local device creation...");
    let device = DeviceRequest {
        device_name: Some(BOT_DEVICE.into()),
        ..DeviceRequest::new(username, password)
    };
    match flow.create_device(&device, None) {
        Ok(_) => {
            thread::sleep(INSTALL_SETTLE);
            println!("* Account has been installed locally.");
            return Ok(());
        }
        Err(err) => log::debug!("device creation failed: {err}"),
    }

    println!("* Account does not exist, creating account...");
    let account = AccountRequest {
        device_name: Some(BOT_DEVICE.into()),
        ..AccountRequest::new(username, password)
    };
    flow.create_account(&account, None).context("account couldn't be installed")?;
    thread::sleep(INSTALL_SETTLE);
    println!("* Account has been successfully created and installed locally.");
    Ok(())
}

/// Dispatches notifications until the process is killed, reporting polling
/// errors as they show up.
fn drain_forever(flow: &Flow) -> Result<()> {
    let stop = StopFlag::new();
    while !stop.is_stopped() {
        flow.process_one_notification(DEFAULT_DRAIN_TIMEOUT, None)?;
        if let Some(err) = flow.get_notification_error(Duration::ZERO, None) {
            log::warn!("notification polling: {err}");
        }
        if flow.backend().is_some_and(|backend| backend.has_exited()) {
            log::warn!("backend exited, stopping");
            stop.stop();
        }
    }
    Ok(())
}

fn field<'a>(value: &'a Value, name: &str) -> Result<&'a str, HandlerError> {
    value[name].as_str().ok_or_else(|| format!("missing '{name}' in {value}").into())
}
