use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
pub struct GlobalConfig {
    pub ipc_addr: Option<String>,
    pub modules_dir: Option<String>,
    /// Client sessions without a heartbeat for this long are reaped.
    pub client_ttl_secs: Option<u64>,
}

impl GlobalConfig {
    pub fn load() -> anyhow::Result<Self> {
        let s = std::fs::read_to_string("config/global.toml").unwrap_or_default();
        let cfg: Self = toml::from_str(&s).unwrap_or(Self {
            ipc_addr: None,
            modules_dir: None,
            client_ttl_secs: None,
        });
        Ok(cfg)
    }
}
