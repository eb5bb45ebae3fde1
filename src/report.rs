//! `goma_ctl report`: bundles daemon telemetry and logs into a tarball.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::VecDeque;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::config;
use crate::driver::Driver;
use crate::error::Result;

const REPORT_FILE: &str = "goma-report.tgz";
const TELEMETRY_PAGES: &[&str] = &["compilerinfoz", "histogramz", "serverz", "statz"];
const RECENT_BUILD_DIRS: usize = 10;

impl Driver {
    pub async fn report(&mut self) -> Result<PathBuf> {
        let staging = tempfile::TempDir::new()?;

        let healthy = self.control("/healthz", false).await?.status;
        if healthy {
            println!("compiler_proxy is working:");
            for key in TELEMETRY_PAGES {
                let reply = self.control(&format!("/{}", key), false).await?;
                if !reply.status {
                    println!("  failed to get {}: {}", key, reply.message);
                    continue;
                }
                println!("  include /{}", key);
                fs::write(staging.path().join(format!("{}-output", key)), reply.message)?;
            }
        } else {
            println!("compiler_proxy is not working:");
            println!("  omit compiler_proxy stats");
        }

        let log_dir = config::log_dir();
        for command in ["compiler_proxy", "compiler_proxy-subproc"] {
            match latest_info_log(&log_dir, command)? {
                Some(log) => {
                    if let Some(name) = log.file_name() {
                        fs::copy(&log, staging.path().join(name))?;
                    }
                }
                None => println!("{} log was not found", command),
            }
        }

        match infer_build_dir(&log_dir)? {
            Some(build_dir) => {
                println!("build directory is inferred as {}", build_dir.display());
                fs::copy(
                    build_dir.join(".ninja_log"),
                    staging.path().join("ninja_log"),
                )?;
                println!("  include ninja_log");
            }
            None => {
                println!("build directory cannot be inferred:");
                println!("  omit ninja_log");
            }
        }

        let output = config::system_temp_dir().join(REPORT_FILE);
        write_tgz(staging.path(), &output)?;
        println!();
        println!("A report file is successfully created:");
        println!("  {}", output.display());
        Ok(output)
    }
}

/// Newest `<command>.*.INFO.*` log by name.
fn latest_info_log(log_dir: &Path, command: &str) -> Result<Option<PathBuf>> {
    let prefix = format!("{}.", command);
    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut candidates = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&prefix) && name[prefix.len()..].contains(".INFO.") {
            candidates.push(entry.path());
        }
    }
    Ok(candidates.into_iter().max())
}

/// Value of the last ` build_dir=` on a `Task: ... Start ...` log line.
fn build_dir_of(line: &str) -> Option<&str> {
    let after_task = &line[line.find("Task:")? + "Task:".len()..];
    let after_start = &after_task[after_task.find("Start")? + "Start".len()..];
    let marker = " build_dir=";
    Some(&after_start[after_start.rfind(marker)? + marker.len()..])
}

/// Most frequent of the last few build directories that has a `.ninja_log`.
fn infer_build_dir(log_dir: &Path) -> Result<Option<PathBuf>> {
    let Some(log) = latest_info_log(log_dir, "compiler_proxy")? else {
        println!("compiler_proxy log was not found");
        return Ok(None);
    };
    let contents = fs::read_to_string(&log)?;

    let mut recent = VecDeque::with_capacity(RECENT_BUILD_DIRS + 1);
    for dir in contents.lines().filter_map(build_dir_of) {
        recent.push_back(dir);
        if recent.len() > RECENT_BUILD_DIRS {
            recent.pop_front();
        }
    }

    // First-seen order breaks ties.
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for dir in recent {
        match counts.iter_mut().find(|(d, _)| *d == dir) {
            Some((_, n)) => *n += 1,
            None => counts.push((dir, 1)),
        }
    }
    counts.sort_by(|a, b| b.1.cmp(&a.1));

    Ok(counts
        .into_iter()
        .map(|(dir, _)| PathBuf::from(dir))
        .find(|dir| dir.join(".ninja_log").exists()))
}

fn write_tgz(source: &Path, output: &Path) -> Result<()> {
    let encoder = GzEncoder::new(File::create(output)?, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(".", source)?;
    builder.into_inner()?.finish()?;
    Ok(())
}
