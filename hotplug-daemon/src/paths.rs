use std::path::{Path, PathBuf};

pub const DAEMON_LABEL: &str = "dev.hotplug.daemon";

pub const DAEMON_SOCKET: &str = "control.sock";
pub const CONFIG_FILE: &str = "config.yaml";

pub fn hotplug_root(home: &Path) -> PathBuf {
    home.join(".hotplug")
}

pub fn config_path(home: &Path) -> PathBuf {
    hotplug_root(home).join(CONFIG_FILE)
}

pub fn db_root(home: &Path) -> PathBuf {
    hotplug_root(home).join("db")
}

pub fn run_dir(home: &Path) -> PathBuf {
    hotplug_root(home).join("run")
}

pub fn socket_path(home: &Path) -> PathBuf {
    run_dir(home).join(DAEMON_SOCKET)
}
