use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CtlError, Result};
use crate::flags::{self, GomaFlags};
use crate::platform::Platform;

pub const INSTALL_DIR_ENV: &str = "GOMACTL_INSTALL_DIR";
pub const PACKAGE_BASE_URL_ENV: &str = "GOMACTL_PACKAGE_BASE_URL";
pub const CHANNEL_ENV: &str = "GOMACHANNEL";
pub const PLATFORM_ENV: &str = "PLATFORM";

/// Marker file in the installation root that disables auto-update on start.
pub const NO_AUTO_UPDATE_FILE: &str = "no_auto_update";

pub const LATEST_DIR: &str = "latest";
pub const UPDATE_DIR: &str = "update";
pub const BACKUP_DIR: &str = "backup";

const TMP_DIR_PREFIX: &str = "goma_";
const CRASH_DUMP_DIR: &str = "goma_crash";
const CACHE_DIR: &str = "goma_cache";

/// Bounded waits used by the supervisor and the downloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub cooldown_attempts: u32,
    pub cooldown_interval: Duration,
    pub port_poll_interval: Duration,
    pub probe_timeout: Duration,
    /// Added on top of `GOMA_PING_TIMEOUT_SEC` for the port-resolution deadline.
    pub ping_grace: Duration,
    pub manifest_fresh_window: Duration,
    pub download_retries: u32,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            cooldown_attempts: 5,
            cooldown_interval: Duration::from_secs(1),
            port_poll_interval: Duration::from_millis(200),
            probe_timeout: Duration::from_secs(1),
            ping_grace: Duration::from_secs(20),
            manifest_fresh_window: Duration::from_secs(4 * 60 * 60),
            download_retries: 5,
        }
    }
}

/// OS resources held by a running compiler_proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonResources {
    pub socket: PathBuf,
    pub lock: PathBuf,
    pub port: String,
}

#[derive(Debug, Clone)]
pub struct CtlConfig {
    pub install_dir: PathBuf,
    pub daemon_binary: PathBuf,
    pub helper_binary: PathBuf,
    pub tmp_dir: PathBuf,
    pub crash_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub flags: GomaFlags,
    pub timing: Timing,
    pub package_base_url: Option<String>,
    pub channel: Option<String>,
    pub platform_override: Option<String>,
}

impl CtlConfig {
    /// Builds the configuration from the process environment.
    pub fn from_env(platform: &dyn Platform) -> Result<Self> {
        let install_dir = match env_opt(INSTALL_DIR_ENV) {
            Some(dir) => PathBuf::from(dir),
            None => env::current_exe()?
                .parent()
                .map(Path::to_path_buf)
                .ok_or_else(|| CtlError::Config("cannot locate installation directory".into()))?,
        };

        let mut config = Self::with_install_dir(
            install_dir,
            GomaFlags::from_process_env(),
            platform,
        );
        let proxy = flags::detect_proxy(|name| env::var(name).ok())?;
        config.flags.apply_proxy(proxy.as_ref());
        config.package_base_url = env_opt(PACKAGE_BASE_URL_ENV);
        config.channel = env_opt(CHANNEL_ENV);
        config.platform_override = env_opt(PLATFORM_ENV);

        tracing::debug!(
            install_dir = %config.install_dir.display(),
            tmp_dir = %config.tmp_dir.display(),
            "Resolved configuration"
        );
        Ok(config)
    }

    /// Configuration rooted at `install_dir` with the given flag set.
    pub fn with_install_dir(
        install_dir: PathBuf,
        mut flags: GomaFlags,
        platform: &dyn Platform,
    ) -> Self {
        flags.apply_platform_defaults(platform.default_flags(), platform.default_ssl_flags());

        let daemon_binary = flags
            .get(flags::COMPILER_PROXY_BINARY)
            .map(PathBuf::from)
            .unwrap_or_else(|| install_dir.join(platform.daemon_binary_name()));
        let helper_binary = install_dir.join(platform.helper_binary_name());

        let tmp_dir = match flags.get(flags::TMP_DIR) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => platform.tmp_dir(),
        };
        flags.set(flags::TMP_DIR, &tmp_dir.to_string_lossy());

        let crash_dir = tmp_dir.join(CRASH_DUMP_DIR);
        let cache_dir = match flags.get(flags::CACHE_DIR) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => tmp_dir.join(CACHE_DIR),
        };

        Self {
            install_dir,
            daemon_binary,
            helper_binary,
            tmp_dir,
            crash_dir,
            cache_dir,
            flags,
            timing: Timing::default(),
            package_base_url: None,
            channel: None,
            platform_override: None,
        }
    }

    pub fn latest_dir(&self) -> PathBuf {
        self.install_dir.join(LATEST_DIR)
    }

    pub fn update_dir(&self) -> PathBuf {
        self.install_dir.join(UPDATE_DIR)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.install_dir.join(BACKUP_DIR)
    }

    pub fn auto_update_enabled(&self) -> bool {
        !self.install_dir.join(NO_AUTO_UPDATE_FILE).exists()
    }

    /// Deadline for resolving the control port of a starting daemon.
    pub fn ping_deadline(&self) -> Duration {
        let base = self
            .flags
            .get(flags::PING_TIMEOUT_SEC)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(60);
        Duration::from_secs(base) + self.timing.ping_grace
    }

    pub fn resources(&self) -> DaemonResources {
        let socket_name = self
            .flags
            .get(flags::COMPILER_PROXY_SOCKET_NAME)
            .unwrap_or("goma.ipc");
        let lock_name = self
            .flags
            .get(flags::COMPILER_PROXY_LOCK_FILENAME)
            .unwrap_or("goma_compiler_proxy.lock");
        let port = self
            .flags
            .get(flags::COMPILER_PROXY_PORT)
            .unwrap_or("8088")
            .to_string();
        DaemonResources {
            socket: self.tmp_dir.join(socket_name),
            lock: self.tmp_dir.join(format!("{}.{}", lock_name, port)),
            port,
        }
    }

    /// True when the operator left the control channel at its default, so
    /// another invocation may be talking to the same daemon.
    pub fn may_use_default_channel(&self) -> bool {
        !self.flags.is_user_set(flags::COMPILER_PROXY_SOCKET_NAME)
    }
}

fn env_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

/// First candidate variable naming an existing directory, else `/tmp`.
fn first_existing_dir(candidates: &[&str]) -> PathBuf {
    candidates
        .iter()
        .filter_map(|name| env_opt(name))
        .map(PathBuf::from)
        .find(|p| p.is_dir())
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

pub fn system_temp_dir() -> PathBuf {
    first_existing_dir(&["TEST_TMPDIR", "TMPDIR", "TMP"])
}

/// Where compiler_proxy writes its glog files.
pub fn log_dir() -> PathBuf {
    first_existing_dir(&["GLOG_log_dir", "TEST_TMPDIR", "TMPDIR", "TMP"])
}

/// Name of the invoking user; `root` is skipped so sudo keeps the real user.
pub fn username() -> String {
    ["SUDO_USER", "USERNAME", "USER", "LOGNAME"]
        .iter()
        .filter_map(|name| env_opt(name))
        .find(|v| v != "root")
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn user_tmp_dir_name() -> String {
    format!("{}{}", TMP_DIR_PREFIX, username())
}
