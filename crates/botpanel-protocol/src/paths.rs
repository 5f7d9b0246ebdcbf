use std::path::PathBuf;

/// Returns the config/data directory path for botpanel.
pub fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("botpanel")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("botpanel")
    } else {
        // SAFETY: getuid() is always safe to call and has no preconditions
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/botpanel-{uid}"))
    }
}

/// Returns the config file path for the botpanel server.
pub fn config_path() -> PathBuf {
    dirs_path().join("config.toml")
}

/// Directory holding one working folder per bot, relative to the process cwd.
pub fn default_bots_dir() -> PathBuf {
    PathBuf::from("bots")
}
