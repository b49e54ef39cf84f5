use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".strand"))
            .unwrap_or_else(|| PathBuf::from(".strand"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn checkpoint_db(&self) -> PathBuf {
        self.base.join("checkpoints.db")
    }

    pub fn profiles_file(&self) -> PathBuf {
        self.base.join("user_profile.json")
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}
