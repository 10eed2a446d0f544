use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Port the host API listens on (loopback only)
    pub port: u16,
    /// Directory holding the node executable and per-network state
    pub install_home: PathBuf,
    /// Value of `HOME` handed to the node process
    pub home_dir: PathBuf,
    /// File name of the installed executable inside `install_home`
    pub binary_name: String,
    /// Release location; artifacts are fetched from `<base>/<artifact>`
    pub release_base_url: String,
    /// Name of the variable that tells the node where its home is
    pub install_home_env_var: String,
    /// How often a live process re-announces its pid
    pub pid_announce_interval: Duration,
    /// Upper bound for one binary download
    pub download_timeout: Duration,
    /// Network selected when the host starts
    pub default_network: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let home_dir = match std::env::var("NODE_HOME_DIR") {
            Ok(v) => PathBuf::from(v),
            Err(_) => dirs::home_dir()
                .ok_or_else(|| anyhow::anyhow!("could not resolve home directory; set NODE_HOME_DIR"))?,
        };
        let install_home = std::env::var("NODE_INSTALL_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home_dir.join(".node-host"));

        Ok(Self {
            port: env_parse("NODE_HOST_PORT", 9390)?,
            install_home,
            home_dir,
            binary_name: env_str("NODE_BINARY_NAME", "celestia"),
            release_base_url: env_str(
                "NODE_RELEASE_BASE_URL",
                "https://github.com/celestiaorg/celestia-node/releases/latest/download",
            )
            .trim_end_matches('/')
            .to_string(),
            install_home_env_var: env_str("NODE_HOME_ENV_VAR", "NODE_HOME"),
            pid_announce_interval: Duration::from_millis(env_parse("NODE_PID_ANNOUNCE_MS", 1000)?),
            download_timeout: Duration::from_secs(env_parse("NODE_DOWNLOAD_TIMEOUT_SECS", 1800)?),
            default_network: env_str("NODE_NETWORK", "arabica-10"),
        })
    }

    /// Full path of the installed node executable.
    pub fn binary_path(&self) -> PathBuf {
        self.install_home.join(&self.binary_name)
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}
