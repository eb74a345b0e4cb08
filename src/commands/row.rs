use clap::{Args, Subcommand, ValueEnum};
use serde_json::Value;
use std::io::{self, Write};

use chatsync::db::{TableStore, WriteSource};
use chatsync::TableKey;

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Args)]
pub struct RowCommand {
    #[command(subcommand)]
    pub command: RowSubcommand,
}

#[derive(Subcommand)]
pub enum RowSubcommand {
    /// List all rows of a table
    List {
        /// Table (sessions, sessionGroups, topics, messages, plugins)
        table: TableKey,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show a single row
    Get {
        /// Table (sessions, sessionGroups, topics, messages, plugins)
        table: TableKey,

        /// Row id
        id: String,
    },

    /// Create or replace a row from a JSON object
    Put {
        /// Table (sessions, sessionGroups, topics, messages, plugins)
        table: TableKey,

        /// Row as JSON; must carry an "id" (or "identifier") field
        json: String,
    },

    /// Delete a row
    Delete {
        /// Table (sessions, sessionGroups, topics, messages, plugins)
        table: TableKey,

        /// Row id
        id: String,

        /// Skip confirmation prompt
        #[arg(long, short)]
        force: bool,
    },
}

impl RowCommand {
    pub async fn run(&self, tables: &TableStore) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            RowSubcommand::List { table, format } => {
                let rows = tables.list(*table).await?;

                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&rows)?);
                    }
                    OutputFormat::Text => {
                        if rows.is_empty() {
                            println!("No rows in {}.", table);
                            return Ok(());
                        }
                        for row in &rows {
                            println!("{}", serde_json::to_string(row)?);
                        }
                        println!();
                        println!("{} row(s)", rows.len());
                    }
                }
                Ok(())
            }

            RowSubcommand::Get { table, id } => match tables.get(*table, id).await? {
                Some(row) => {
                    println!("{}", serde_json::to_string_pretty(&row)?);
                    Ok(())
                }
                None => Err(format!("Row not found: {}", id).into()),
            },

            RowSubcommand::Put { table, json } => {
                let row: Value = serde_json::from_str(json)?;
                if !row.is_object() {
                    return Err("Row must be a JSON object".into());
                }

                let created = tables.put(*table, row, WriteSource::User).await?;
                println!("{} row in {}", if created { "Created" } else { "Updated" }, table);
                Ok(())
            }

            RowSubcommand::Delete { table, id, force } => {
                if tables.get(*table, id).await?.is_none() {
                    return Err(format!("Row not found: {}", id).into());
                }

                // Confirm deletion unless --force is used
                if !force {
                    print!("Delete row '{}' from {}? [y/N] ", id, table);
                    io::stdout().flush()?;

                    let mut input = String::new();
                    io::stdin().read_line(&mut input)?;

                    if !input.trim().eq_ignore_ascii_case("y") {
                        println!("Deletion cancelled.");
                        return Ok(());
                    }
                }

                tables.delete(*table, id, WriteSource::User).await?;
                println!("Deleted row: {}", id);
                Ok(())
            }
        }
    }
}
