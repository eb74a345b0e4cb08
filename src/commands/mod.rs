mod config_cmd;
mod row;
mod sync_cmd;

pub use config_cmd::ConfigCommand;
pub use row::RowCommand;
pub use sync_cmd::SyncCommand;
