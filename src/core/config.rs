use std::path::PathBuf;

/// Store-wide configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,

    // Initial values handed to the sequence counters on first use
    pub initial_uid: u64,
    pub initial_uidvalidity: u64,
    pub initial_mailbox_id: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("./data"),
            initial_uid: 1,
            initial_uidvalidity: 1,
            initial_mailbox_id: 0,
        }
    }
}

impl Config {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Config {
            data_dir: data_dir.into(),
            ..Config::default()
        }
    }
}
