use clap::{Args, Subcommand, ValueEnum};

use chatsync::Config;

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show current configuration values
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

impl ConfigCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ConfigSubcommand::Show { format } => {
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(config)?);
                    }
                    OutputFormat::Text => print_text(config),
                }
                Ok(())
            }
        }
    }
}

fn print_text(config: &Config) {
    println!("Configuration");
    println!("=============\n");

    if let Some(path) = &config.config_file {
        println!("Config file: {}", path.display());
    } else {
        println!(
            "Config file: {} (not found)",
            Config::default_config_path().display()
        );
    }
    println!();

    println!("database_path: {}", config.database_path.value.display());
    println!("  source: {}", config.database_path.source);
    println!();

    println!("device_name: {}", config.device_name.value);
    println!("  source: {}", config.device_name.source);
    println!();

    let sync = &config.sync;
    println!("sync:");
    println!(
        "  channel_name: {}",
        sync.channel_name.as_deref().unwrap_or("(not set)")
    );
    println!(
        "  password:     {}",
        if sync.password.is_some() { "(set)" } else { "(not set)" }
    );
    println!("  signaling:    {}", sync.signaling_url());
    println!(
        "  device_id:    {}",
        sync.device_id.as_deref().unwrap_or("(random per run)")
    );
    let policy = sync.reconnect_policy();
    println!(
        "  reconnect:    {}ms .. {}ms",
        policy.initial.as_millis(),
        policy.max.as_millis()
    );
}
