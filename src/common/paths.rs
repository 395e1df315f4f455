use directories::ProjectDirs;
use std::path::PathBuf;

pub fn system_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/ridgeline/prints")
}

pub fn system_config_file() -> PathBuf {
    PathBuf::from("/etc/ridgeline/ridgeline.toml")
}

/// Per-user fallback for development runs without root.
pub fn user_data_dir() -> Option<PathBuf> {
    ProjectDirs::from("io", "ridgeline", "Ridgeline").map(|d| d.data_dir().join("prints"))
}
