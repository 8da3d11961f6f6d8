use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".harvester"))
            .unwrap_or_else(|| PathBuf::from(".harvester"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.base.join("state")
    }

    /// Durable flag tier; everything else about a refresh run is in-memory.
    pub fn flags_file(&self) -> PathBuf {
        self.state_dir().join("flags.json")
    }

    pub fn profile_dir(&self) -> PathBuf {
        self.base.join("browser-profile")
    }

    pub fn cookies_file(&self) -> PathBuf {
        self.base.join("cookies.json")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.state_dir())?;
        std::fs::create_dir_all(self.profile_dir())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}
