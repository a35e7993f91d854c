use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Non-secret operator preferences persisted across runs. The Ed25519 key
/// itself is never stored here; it is loaded fresh from a PEM path each run.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct State {
    pub key_path: Option<String>,
    pub last_serial: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
}

fn config_path() -> PathBuf {
    if let Some(dir) = dirs_next::config_dir() {
        return dir.join("aoa-mirror-host").join("state.json");
    }
    // Fallback to current directory
    PathBuf::from(".aoa-mirror-host_state.json")
}

pub fn load_state() -> State {
    let path = config_path();
    if let Ok(bytes) = fs::read(&path) {
        if let Ok(state) = serde_json::from_slice::<State>(&bytes) {
            return state;
        }
    }
    State::default()
}

pub fn save_state(state: &State) -> Result<()> {
    let path = config_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).ok();
    }
    let bytes = serde_json::to_vec_pretty(state)?;
    fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))
}
