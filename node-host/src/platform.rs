/// Operating system + CPU architecture pair, as reported by `std::env::consts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    pub fn current() -> Self {
        Self::new(std::env::consts::OS, std::env::consts::ARCH)
    }

    /// Release naming for this pair, `None` when no artifact is published.
    pub fn release_pair(&self) -> Option<(&'static str, &'static str)> {
        let os = match self.os.as_str() {
            "linux" => "linux",
            "macos" => "darwin",
            _ => return None,
        };
        let arch = match self.arch.as_str() {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            _ => return None,
        };
        Some((os, arch))
    }

    /// Artifact file name for `binary`, e.g. `celestia-darwin-arm64`.
    pub fn artifact_name(&self, binary: &str) -> Option<String> {
        self.release_pair()
            .map(|(os, arch)| format!("{binary}-{os}-{arch}"))
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}
