//! Runs a sync session in the foreground.

use clap::Args;
use std::sync::Arc;
use tracing::info;

use chatsync::db::TableStore;
use chatsync::{
    Config, StartDataSyncParams, SyncBus, SyncChannel, SyncError, SyncNotification, SyncUser,
    WsConnector,
};

/// Sync with peers in a channel
#[derive(Debug, Args)]
pub struct SyncCommand {
    /// Channel name (overrides sync.channel_name)
    #[arg(long)]
    channel: Option<String>,

    /// Channel password (overrides sync.password)
    #[arg(long)]
    password: Option<String>,

    /// Relay URL (overrides sync.signaling)
    #[arg(long)]
    signaling: Option<String>,
}

impl SyncCommand {
    pub async fn run(
        &self,
        tables: TableStore,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let mut sync_config = config.sync.clone();
        if let Some(channel) = &self.channel {
            sync_config.channel_name = Some(channel.clone());
        }
        if let Some(password) = &self.password {
            sync_config.password = Some(password.clone());
        }
        if let Some(signaling) = &self.signaling {
            sync_config.signaling = Some(signaling.clone());
        }

        let channel: SyncChannel = sync_config.channel().ok_or(SyncError::NotConfigured)?;
        let user = SyncUser::from_env(
            sync_config.device_id.clone(),
            Some(config.device_name.value.clone()),
        );

        let mut bus = SyncBus::new(tables, Arc::new(WsConnector))
            .with_options(sync_config.sync_options());
        let mut handle = bus
            .start_data_sync(StartDataSyncParams {
                channel: channel.clone(),
                user,
                signaling: None,
            })
            .await?;

        println!(
            "Syncing channel '{}' via {} (Ctrl-C to stop)",
            channel.name,
            sync_config.signaling_url()
        );

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    break;
                }
                notification = handle.next_notification() => match notification {
                    Some(notification) => report(&notification),
                    None => break,
                },
            }
        }

        handle.stop().await;
        println!("Sync stopped.");
        Ok(())
    }
}

fn report(notification: &SyncNotification) {
    match notification {
        SyncNotification::Status(status) => println!("status: {}", status),
        SyncNotification::Awareness(records) => {
            println!("peers: {}", records.len());
            for record in records {
                println!(
                    "  {} {} ({}){}",
                    record.client_id,
                    record.user.name.as_deref().unwrap_or("unnamed"),
                    record.user.id,
                    if record.current { " *" } else { "" }
                );
            }
        }
        SyncNotification::Event(event) => {
            for change in &event.changes {
                println!("{}: {} {}", event.table_key, change.action, change.id);
            }
        }
    }
}
