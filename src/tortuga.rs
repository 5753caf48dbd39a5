use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use log::{info, warn};
use pwhash::md5_crypt;
use tokio::process::Command;
use tokio::time::sleep;

use crate::services::openid_service::{self, OpenidLogin};
use crate::util::generators::generate_random_string;

/// Sentinel written by the installer; its presence means first-boot
/// initialization is still in progress.
const FIRSTBOOT_MARKER: &str = "/.tortuga_firstboot";

const FIRSTBOOT_POLL_INTERVAL: Duration = Duration::from_secs(5);

// -----------------------------------------------------------------------------
// Models
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Json,
    Yaml,
}

impl TryFrom<&str> for FileFormat {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "json" => Ok(FileFormat::Json),
            "yaml" => Ok(FileFormat::Yaml),
            _ => Err(format!("Unsupported file format: {}", value)),
        }
    }
}

// -----------------------------------------------------------------------------
// Facade
// -----------------------------------------------------------------------------

/// Keyword facade collecting the Tortuga test helpers.
///
/// With `remote` set, log lines are also printed to stdout so a remote
/// test runner captures them.
pub struct Tortuga {
    remote: bool,
    firstboot_marker: PathBuf,
    firstboot_poll_interval: Duration,
    firstboot_timeout: Option<Duration>,
}

impl Tortuga {
    pub fn new(remote: bool) -> Self {
        Tortuga {
            remote,
            firstboot_marker: PathBuf::from(FIRSTBOOT_MARKER),
            firstboot_poll_interval: FIRSTBOOT_POLL_INTERVAL,
            firstboot_timeout: None,
        }
    }

    pub fn with_firstboot_marker(mut self, marker: impl Into<PathBuf>) -> Self {
        self.firstboot_marker = marker.into();
        self
    }

    pub fn with_firstboot_poll_interval(mut self, interval: Duration) -> Self {
        self.firstboot_poll_interval = interval;
        self
    }

    /// Bounds the firstboot wait. The default is `None`: the wait blocks
    /// until some external process removes the marker.
    pub fn with_firstboot_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.firstboot_timeout = timeout;
        self
    }

    fn log_info(&self, msg: &str) {
        info!("{}", msg);
        if self.remote {
            println!("INFO: {}", msg);
        }
    }

    fn log_warn(&self, msg: &str) {
        warn!("{}", msg);
        if self.remote {
            println!("WARNING: {}", msg);
        }
    }

    /// Waits for Tortuga to finish its boot/initialization process, polling
    /// for the firstboot marker to disappear.
    pub async fn wait_for_firstboot(&self) -> Result<()> {
        let started = Instant::now();

        while self.firstboot_marker.exists() {
            if let Some(limit) = self.firstboot_timeout {
                if started.elapsed() >= limit {
                    bail!("Timed out waiting for firstboot to complete");
                }
            }

            sleep(self.firstboot_poll_interval).await;
        }

        Ok(())
    }

    /// Creates a salted MD5-crypt password hash, suitable for a Linux
    /// password file. With `escape`, `$` characters are escaped so the hash
    /// survives being passed on a command line.
    pub fn hash_password(&self, password: &str, escape: bool) -> Result<String> {
        let mut hash = md5_crypt::hash(password)
            .map_err(|err| anyhow!("Error hashing password: {}", err))?;

        if escape {
            hash = hash.replace('$', "\\$");
        }

        Ok(hash)
    }

    /// Generates a random password and the (escaped) hash for it.
    pub fn generate_password(&self, length: usize) -> Result<(String, String)> {
        let password = generate_random_string(length);
        let hash = self.hash_password(&password, true)?;

        Ok((password, hash))
    }

    /// Tests a credential pair against the OS authentication stack.
    #[cfg(feature = "pam-auth")]
    pub fn pam_authenticate(&self, username: &str, password: &str) -> Result<bool> {
        let mut authenticator = pam::Authenticator::with_password("login")
            .map_err(|err| anyhow!("Error opening PAM session: {}", err))?;
        authenticator.get_handler().set_credentials(username, password);

        Ok(authenticator.authenticate().is_ok())
    }

    #[cfg(not(feature = "pam-auth"))]
    pub fn pam_authenticate(&self, _username: &str, _password: &str) -> Result<bool> {
        bail!("PAM support not compiled in; enable the pam-auth feature")
    }

    /// Scripted OpenID-Connect login against a test identity provider.
    pub async fn openid_authenticate(&self, login: OpenidLogin) -> Result<bool> {
        self.log_info(&format!(
            "Authenticating {} against {}",
            login.username, login.issuer
        ));

        openid_service::authenticate(&login).await
    }

    /// Runs a Tortuga CLI command under a shell, returning its stdout.
    ///
    /// `exit_codes` is the set of exit codes accepted as success; an empty
    /// slice means the default of exactly 0.
    pub async fn run_command(&self, args: &[&str], exit_codes: &[i32]) -> Result<String> {
        let cmd = args.join(" ");
        self.log_info(&cmd);

        let output = Command::new("sh")
            .arg("-c")
            .arg(&cmd)
            .output()
            .await
            .map_err(|err| anyhow!("Error running command: {}", err))?;

        let accepted: &[i32] = if exit_codes.is_empty() { &[0] } else { exit_codes };
        let code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

        if !accepted.contains(&code) {
            self.log_warn(&stdout);
            self.log_warn(&String::from_utf8_lossy(&output.stderr));
            bail!("Unsuccessful exit code: {}", code);
        }

        Ok(stdout)
    }

    /// Reads and parses a JSON or YAML file into a generic value.
    pub fn parse_file(&self, path: &str, fmt: &str) -> Result<serde_json::Value> {
        if !Path::new(path).exists() {
            bail!("File not found: {}", path);
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|err| anyhow!("Error reading file {}: {}", path, err))?;

        match FileFormat::try_from(fmt).map_err(|err| anyhow!(err))? {
            FileFormat::Json => serde_json::from_str(&contents)
                .map_err(|err| anyhow!("Error parsing {} as JSON: {}", path, err)),
            FileFormat::Yaml => serde_yaml::from_str(&contents)
                .map_err(|err| anyhow!("Error parsing {} as YAML: {}", path, err)),
        }
    }
}

impl Default for Tortuga {
    fn default() -> Self {
        Self::new(false)
    }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
