use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use autopilot::config::Config;
use autopilot::store::FileStore;

/// Default content for .autopilot/.gitignore
const GITIGNORE_CONTENT: &str = r#"# autopilot gitignore
# Raw agent output (can be large)
sessions/

store.lock
"#;

pub fn run(dir: &Path) -> Result<()> {
    if FileStore::open(dir).exists() {
        anyhow::bail!("autopilot already initialized at {}", dir.display());
    }

    FileStore::create(dir).context("Failed to create store")?;
    Config::init(dir).context("Failed to write default config")?;
    fs::write(dir.join(".gitignore"), GITIGNORE_CONTENT).context("Failed to create .gitignore")?;

    println!("Initialized autopilot at {}", dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use autopilot::config::CONFIG_FILE;
    use tempfile::tempdir;

    #[test]
    fn test_init_creates_store_and_config() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join(".autopilot");
        run(&dir).unwrap();

        assert!(FileStore::open(&dir).exists());
        assert!(dir.join(CONFIG_FILE).exists());
        assert!(dir.join(".gitignore").exists());
    }

    #[test]
    fn test_init_twice_fails() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join(".autopilot");
        run(&dir).unwrap();
        assert!(run(&dir).is_err());
    }
}
