//! Scripted collaborators shared by the unit tests.

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::checksum::{self, CHECKSUM_FILE};
use crate::config::{CtlConfig, Timing};
use crate::driver::Driver;
use crate::error::{CtlError, Result};
use crate::flags::{self, GomaFlags};
use crate::manifest::{Manifest, MANIFEST_FILE};
use crate::package;
use crate::platform::{Caller, DaemonProcess, Platform, PortProbe};
use crate::source::PackageSource;
use crate::stakeholder::Owner;

pub const FAKE_DAEMON_PID: u32 = 4242;
const FAKE_UID: u32 = 1000;
const PACKAGE_MTIME: u64 = 1_600_000_000;

const FAKE_FLAGS: &[(&str, &str)] = &[
    (flags::COMPILER_PROXY_SOCKET_NAME, "goma.ipc"),
    (flags::COMPILER_PROXY_LOCK_FILENAME, "goma_compiler_proxy.lock"),
    (flags::COMPILER_PROXY_PORT, "8088"),
];

struct FakeState {
    running: bool,
    owner_uid: Option<u32>,
    owner_queries: usize,
    port_probes: usize,
    dirs_owned: bool,
    spawn_starts_daemon: bool,
    fail_extract: bool,
    fail_install: bool,
    clobber_backup: bool,
    spawns: usize,
    kills: usize,
    quits: usize,
    stub_port: u16,
    healthz: String,
    flagz: String,
    running_version: String,
}

/// A single pretend compiler_proxy, observable through its control stub.
#[derive(Clone)]
pub struct FakePlatform {
    state: Arc<Mutex<FakeState>>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                running: false,
                owner_uid: Some(FAKE_UID),
                owner_queries: 0,
                port_probes: 0,
                dirs_owned: true,
                spawn_starts_daemon: true,
                fail_extract: false,
                fail_install: false,
                clobber_backup: false,
                spawns: 0,
                kills: 0,
                quits: 0,
                stub_port: 0,
                healthz: "ok".into(),
                flagz: String::new(),
                running_version: String::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn set_running(&self, running: bool) {
        self.lock().running = running;
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn set_owner_uid(&self, uid: Option<u32>) {
        self.lock().owner_uid = uid;
    }

    pub fn owner_queries(&self) -> usize {
        self.lock().owner_queries
    }

    pub fn port_probes(&self) -> usize {
        self.lock().port_probes
    }

    pub fn set_dirs_owned(&self, owned: bool) {
        self.lock().dirs_owned = owned;
    }

    /// When false, a spawned daemon never answers on its control port.
    pub fn set_spawn_starts_daemon(&self, starts: bool) {
        self.lock().spawn_starts_daemon = starts;
    }

    pub fn set_fail_extract(&self, fail: bool) {
        self.lock().fail_extract = fail;
    }

    /// Installing copies the daemon binary, then fails.
    pub fn set_fail_install(&self, fail: bool) {
        self.lock().fail_install = fail;
    }

    /// Installing replaces `backup/` with a plain file, so discarding the
    /// backup afterwards fails.
    pub fn set_clobber_backup(&self, clobber: bool) {
        self.lock().clobber_backup = clobber;
    }

    pub fn spawns(&self) -> usize {
        self.lock().spawns
    }

    pub fn kills(&self) -> usize {
        self.lock().kills
    }

    pub fn quits(&self) -> usize {
        self.lock().quits
    }

    pub fn stub_port(&self) -> u16 {
        self.lock().stub_port
    }

    pub fn set_healthz(&self, message: &str) {
        self.lock().healthz = message.to_string();
    }

    pub fn set_flagz(&self, flagz: &str) {
        self.lock().flagz = flagz.to_string();
    }

    pub fn running_version(&self) -> String {
        self.lock().running_version.clone()
    }

    #[cfg(unix)]
    pub async fn exited_process(&self) -> DaemonProcess {
        let mut child = tokio::process::Command::new("true").spawn().unwrap();
        child.wait().await.unwrap();
        DaemonProcess {
            child: Some(child),
            daemonized: false,
        }
    }

    /// Starts the loopback control stub once. Needs a tokio runtime.
    pub fn serve_control(&self) {
        if self.stub_port() != 0 {
            return;
        }
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        self.lock().stub_port = listener.local_addr().unwrap().port();
        let listener = TcpListener::from_std(listener).unwrap();
        tokio::spawn(serve(listener, self.clone()));
    }

    fn respond(&self, path: &str) -> String {
        let mut state = self.lock();
        match path {
            "/healthz" => state.healthz.clone(),
            "/quitquitquit" => {
                state.quits += 1;
                state.running = false;
                "quit!".into()
            }
            "/versionz" => state.running_version.clone(),
            "/flagz" => state.flagz.clone(),
            other => format!("{} output", other),
        }
    }
}

async fn serve(listener: TcpListener, platform: FakePlatform) {
    while let Ok((mut stream, _)) = listener.accept().await {
        let platform = platform.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            let mut read = 0;
            while read < buf.len() {
                match stream.read(&mut buf[read..]).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => read += n,
                }
                if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let request = String::from_utf8_lossy(&buf[..read]).into_owned();
            let path = request.split_whitespace().nth(1).unwrap_or("/");
            let body = platform.respond(path);
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
    }
}

#[async_trait]
impl Platform for FakePlatform {
    fn daemon_binary_name(&self) -> &'static str {
        "compiler_proxy"
    }

    fn helper_binary_name(&self) -> &'static str {
        "gomacc"
    }

    fn default_flags(&self) -> &'static [(&'static str, &'static str)] {
        FAKE_FLAGS
    }

    fn caller(&self) -> Option<Caller> {
        Some(Caller {
            uid: FAKE_UID,
            privileged: false,
        })
    }

    fn tmp_dir(&self) -> PathBuf {
        std::env::temp_dir().join("goma_fake")
    }

    fn ensure_owned_by_user(&self, _dir: &Path) -> Result<bool> {
        Ok(self.lock().dirs_owned)
    }

    async fn find_owners(&self, resource: &str, _network: bool) -> Result<Vec<Owner>> {
        let mut state = self.lock();
        state.owner_queries += 1;
        if !state.running {
            return Ok(Vec::new());
        }
        Ok(vec![Owner {
            pid: FAKE_DAEMON_PID,
            uid: state.owner_uid,
            resource: resource.to_string(),
        }])
    }

    async fn process_running(&self, _config: &CtlConfig) -> Result<bool> {
        Ok(self.lock().running)
    }

    async fn kill(&self, pids: &BTreeSet<u32>) -> Result<()> {
        let mut state = self.lock();
        state.kills += 1;
        if pids.contains(&FAKE_DAEMON_PID) {
            state.running = false;
        }
        Ok(())
    }

    async fn spawn_daemon(&self, config: &CtlConfig) -> Result<DaemonProcess> {
        let version = fs::read_to_string(&config.daemon_binary)?.trim().to_string();
        let flagz: String = config
            .flags
            .vars()
            .map(|(k, v)| format!("{}={}\n", k, v))
            .collect();
        let mut state = self.lock();
        state.spawns += 1;
        if state.spawn_starts_daemon {
            state.running = true;
            state.running_version = version;
            state.flagz = flagz;
        }
        Ok(DaemonProcess {
            child: None,
            daemonized: true,
        })
    }

    async fn probe_port(&self, _config: &CtlConfig) -> Result<PortProbe> {
        let mut state = self.lock();
        state.port_probes += 1;
        if state.running {
            Ok(PortProbe::Ready(state.stub_port))
        } else {
            Ok(PortProbe::NotReady("connect failed".into()))
        }
    }

    async fn daemon_version(&self, binary: &Path) -> Result<String> {
        Ok(fs::read_to_string(binary)?.trim().to_string())
    }

    async fn extract_package(&self, archive: &Path, dest: &Path) -> Result<()> {
        if self.lock().fail_extract {
            return Err(CtlError::Integrity("corrupt archive".into()));
        }
        package::extract(archive, dest)
    }

    async fn install_package(&self, source: &Path, dest: &Path) -> Result<()> {
        if self.lock().clobber_backup {
            let backup = dest.join(crate::config::BACKUP_DIR);
            fs::remove_dir_all(&backup)?;
            fs::write(&backup, b"not a directory")?;
        }
        if self.lock().fail_install {
            package::copy_file(
                &source.join(self.daemon_binary_name()),
                &dest.join(self.daemon_binary_name()),
            )?;
            return Err(CtlError::Other("disk full".into()));
        }
        package::copy_tree(source, dest)
    }
}

/// Serves packages from a local directory.
pub struct DirSource {
    root: PathBuf,
}

impl DirSource {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl PackageSource for DirSource {
    async fn base_url(&self) -> Result<String> {
        Ok(format!("file://{}", self.root.display()))
    }

    async fn fetch(&self, name: &str) -> Result<Vec<u8>> {
        fs::read(self.root.join(name)).map_err(|e| CtlError::Network(format!("{}: {}", name, e)))
    }
}

fn release_files(version: u64) -> BTreeMap<&'static str, Vec<u8>> {
    BTreeMap::from([
        ("compiler_proxy", format!("compiler_proxy {}", version).into_bytes()),
        ("gomacc", format!("gomacc {}", version).into_bytes()),
    ])
}

fn sha256_table(files: &BTreeMap<&str, Vec<u8>>) -> BTreeMap<String, String> {
    files
        .iter()
        .map(|(name, data)| (name.to_string(), hex::encode(Sha256::digest(data))))
        .collect()
}

fn append(builder: &mut tar::Builder<GzEncoder<Vec<u8>>>, path: &str, data: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o755);
    header.set_mtime(PACKAGE_MTIME);
    builder.append_data(&mut header, path, data).unwrap();
}

fn tgz_with_table(
    platform: &str,
    version: u64,
    files: &BTreeMap<&str, Vec<u8>>,
    table: &BTreeMap<String, String>,
) -> Vec<u8> {
    let root = format!("goma-{}", platform);
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, data) in files {
        append(&mut builder, &format!("{}/{}", root, name), data);
    }
    let manifest = format!("VERSION={}\nPLATFORM={}\n", version, platform);
    append(
        &mut builder,
        &format!("{}/{}", root, MANIFEST_FILE),
        manifest.as_bytes(),
    );
    append(
        &mut builder,
        &format!("{}/{}", root, CHECKSUM_FILE),
        &serde_json::to_vec(table).unwrap(),
    );
    builder.into_inner().unwrap().finish().unwrap()
}

/// A real `.tgz` laid out as `goma-<platform>/...` with a MANIFEST and a
/// matching checksum table.
pub fn build_tgz_package(platform: &str, version: u64, files: &BTreeMap<&str, Vec<u8>>) -> Vec<u8> {
    tgz_with_table(platform, version, files, &sha256_table(files))
}

/// Makes `release` advertise `version` for mac.
pub fn publish_release(release: &Path, version: u64, bad_versions: &str) {
    let mut manifest = format!("VERSION={}\n", version);
    if !bad_versions.is_empty() {
        manifest.push_str(&format!("bad_version={}\n", bad_versions));
    }
    fs::write(release.join(MANIFEST_FILE), manifest).unwrap();
    fs::write(
        release.join("goma-mac.tgz"),
        build_tgz_package("mac", version, &release_files(version)),
    )
    .unwrap();
}

/// Republishes `version` with a checksum table that does not match gomacc.
pub fn tamper_release(release: &Path, version: u64) {
    let files = release_files(version);
    let mut table = sha256_table(&files);
    table.insert("gomacc".into(), "0".repeat(64));
    fs::write(
        release.join("goma-mac.tgz"),
        tgz_with_table("mac", version, &files, &table),
    )
    .unwrap();
}

/// Installs mac `version` under `<dir>/goma`, publishes the same version in
/// `<dir>/release`, and opens a driver on it. Returns the release directory.
pub fn fake_driver(dir: &TempDir, version: u64, platform: &FakePlatform) -> (Driver, PathBuf) {
    let install = dir.path().join("goma");
    fs::create_dir_all(&install).unwrap();
    for (name, data) in release_files(version) {
        fs::write(install.join(name), data).unwrap();
    }
    Manifest::parse(&format!("VERSION={}\nPLATFORM=mac\n", version))
        .write(&install)
        .unwrap();
    checksum::write_table(&install, &["compiler_proxy", "gomacc"]).unwrap();

    let release = dir.path().join("release");
    fs::create_dir_all(&release).unwrap();
    publish_release(&release, version, "");

    (reopen_driver(dir, platform), release)
}

/// A fresh driver (as a second invocation would build) on an installation
/// made by `fake_driver`.
pub fn reopen_driver(dir: &TempDir, platform: &FakePlatform) -> Driver {
    platform.serve_control();
    let tmp = dir.path().join("tmp");
    let flags = GomaFlags::from_vars([
        ("GOMA_TMP_DIR".to_string(), tmp.to_string_lossy().into_owned()),
        ("GOMA_PING_TIMEOUT_SEC".to_string(), "0".to_string()),
    ]);
    let mut config = CtlConfig::with_install_dir(dir.path().join("goma"), flags, platform);
    config.timing = Timing {
        cooldown_attempts: 3,
        cooldown_interval: Duration::from_millis(10),
        port_poll_interval: Duration::from_millis(10),
        probe_timeout: Duration::from_millis(200),
        ping_grace: Duration::from_millis(300),
        ..Timing::default()
    };
    Driver::new(
        config,
        Box::new(platform.clone()),
        Box::new(DirSource::new(dir.path().join("release"))),
    )
    .unwrap()
}
