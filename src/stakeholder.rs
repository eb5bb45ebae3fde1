//! Discovery of processes holding compiler_proxy's socket, lock file and port.

use std::collections::BTreeSet;
use std::fmt;

use crate::config::DaemonResources;
use crate::error::{CtlError, Result};
use crate::platform::{Caller, Platform};

/// A process holding one of the daemon's resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub pid: u32,
    /// `None` when the owning user could not be determined.
    pub uid: Option<u32>,
    pub resource: String,
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.uid {
            Some(uid) => write!(f, "pid={} uid={} resource={}", self.pid, uid, self.resource),
            None => write!(f, "pid={} uid=? resource={}", self.pid, self.resource),
        }
    }
}

/// One record of `lsof -F pun` output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LsofEntry {
    pub pid: Option<u32>,
    pub uid: Option<u32>,
    pub name: Option<String>,
}

/// Parses `lsof -F` field output. A field letter seen twice starts a new
/// record; unknown fields and blank lines are skipped.
pub fn parse_lsof(data: &str) -> Vec<LsofEntry> {
    let mut entries = Vec::new();
    let mut current = LsofEntry::default();

    for line in data.lines() {
        let Some(tag) = line.chars().next() else {
            continue;
        };
        let value = &line[tag.len_utf8()..];
        let repeated = match tag {
            'p' => current.pid.is_some(),
            'u' => current.uid.is_some(),
            'n' => current.name.is_some(),
            _ => continue,
        };
        if repeated {
            entries.push(std::mem::take(&mut current));
        }
        match tag {
            'p' => current.pid = value.trim().parse().ok(),
            'u' => current.uid = value.trim().parse().ok(),
            _ => {
                let name = value.split(" type=").next().unwrap_or(value);
                current.name = Some(name.to_string());
            }
        }
    }
    if current != LsofEntry::default() {
        entries.push(current);
    }
    entries
}

pub fn lsof_owners(data: &str, resource: &str) -> Vec<Owner> {
    parse_lsof(data)
        .into_iter()
        .filter_map(|entry| {
            Some(Owner {
                pid: entry.pid?,
                uid: entry.uid,
                resource: resource.to_string(),
            })
        })
        .collect()
}

/// `fuser -u` prints pids on stdout and `(user)` annotations on stderr.
pub fn parse_fuser(stdout: &str, stderr: &str) -> (Vec<u32>, Vec<String>) {
    let pids = stdout
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect();

    let mut users = Vec::new();
    let mut rest = stderr;
    while let Some(open) = rest.find('(') {
        rest = &rest[open + 1..];
        let Some(close) = rest.find(')') else { break };
        let candidate = &rest[..close];
        if !candidate.is_empty()
            && candidate
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_')
        {
            users.push(candidate.to_string());
        }
        rest = &rest[close + 1..];
    }
    (pids, users)
}

/// Pids listening on `port` according to `netstat -a -n -o`.
pub fn parse_netstat_listeners(output: &str, port: &str) -> BTreeSet<u32> {
    output
        .lines()
        .filter_map(|line| {
            let after_proto = &line[line.find("TCP")?..];
            let after_port = &after_proto[after_proto.find(port)?..];
            let listening = after_port.rfind("LISTENING")?;
            let tail = after_port[listening + "LISTENING".len()..].trim_start();
            let digits: String = tail.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().ok()
        })
        .collect()
}

/// Fails when any owner belongs to someone else and the caller is not
/// privileged. Owners of unknown uid count as someone else's.
pub fn check_ownership(owners: &[Owner], caller: Caller) -> Result<()> {
    if caller.privileged {
        return Ok(());
    }
    let foreign: Vec<String> = owners
        .iter()
        .filter(|o| o.uid != Some(caller.uid))
        .map(Owner::to_string)
        .collect();
    if foreign.is_empty() {
        return Ok(());
    }
    Err(CtlError::OwnershipConflict {
        details: foreign.join(", "),
    })
}

async fn owners_of<P: Platform + ?Sized>(
    platform: &P,
    resource: &str,
    network: bool,
) -> Result<Vec<Owner>> {
    // Socket and lock absence short-circuits without spawning anything.
    if !network && !std::path::Path::new(resource).exists() {
        return Ok(Vec::new());
    }
    platform.find_owners(resource, network).await
}

/// Pids holding the daemon's resources. `quick` only looks at the control
/// socket and skips the ownership check.
pub async fn find_stakeholders<P: Platform + ?Sized>(
    platform: &P,
    resources: &DaemonResources,
    quick: bool,
) -> Result<BTreeSet<u32>> {
    let socket = resources.socket.to_string_lossy();
    let mut owners = owners_of(platform, &socket, false).await?;
    if quick {
        return Ok(owners.iter().map(|o| o.pid).collect());
    }

    let lock = resources.lock.to_string_lossy();
    owners.extend(owners_of(platform, &lock, false).await?);
    owners.extend(owners_of(platform, &format!("TCP:{}", resources.port), true).await?);

    if let Some(caller) = platform.caller() {
        check_ownership(&owners, caller)?;
    }
    tracing::debug!(count = owners.len(), "Resolved stakeholders");
    Ok(owners.iter().map(|o| o.pid).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePlatform;
    use tempfile::TempDir;

    fn owner(pid: u32, uid: u32) -> Owner {
        Owner {
            pid,
            uid: Some(uid),
            resource: "/tmp/goma.ipc".into(),
        }
    }

    #[test]
    fn test_parse_lsof_pairs() {
        let parsed = parse_lsof("u1\np2\nu3\np4\n");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].uid, Some(1));
        assert_eq!(parsed[0].pid, Some(2));
        assert_eq!(parsed[1].uid, Some(3));
        assert_eq!(parsed[1].pid, Some(4));
    }

    #[test]
    fn test_parse_lsof_skips_blank_and_unknown_lines() {
        let parsed = parse_lsof("\n\t\t\n  \nu1\nf12\np2\nnlocalhost:8088\n");
        assert_eq!(
            parsed,
            vec![LsofEntry {
                pid: Some(2),
                uid: Some(1),
                name: Some("localhost:8088".into()),
            }]
        );
    }

    #[test]
    fn test_parse_lsof_drops_socket_type() {
        let parsed = parse_lsof("u1\np2\nn/tmp/goma.ipc type=STREAM\n");
        assert_eq!(parsed[0].name.as_deref(), Some("/tmp/goma.ipc"));
    }

    #[test]
    fn test_parse_fuser() {
        let (pids, users) = parse_fuser(" 1234 5678", "/tmp/goma.ipc:  (alice)(bob)");
        assert_eq!(pids, vec![1234, 5678]);
        assert_eq!(users, vec!["alice".to_string(), "bob".to_string()]);
    }

    #[test]
    fn test_parse_netstat_listeners() {
        let output = "\
  Proto  Local Address          Foreign Address        State           PID
  TCP    127.0.0.1:8088         0.0.0.0:0              LISTENING       4321
  TCP    127.0.0.1:8088         127.0.0.1:50000        ESTABLISHED     4321
  TCP    0.0.0.0:135            0.0.0.0:0              LISTENING       900
";
        let pids = parse_netstat_listeners(output, "8088");
        assert_eq!(pids, BTreeSet::from([4321]));
    }

    #[test]
    fn test_foreign_owner_is_fatal() {
        let owners = vec![owner(1, 1000), owner(2, 1000), owner(3, 2000)];
        let err = check_ownership(
            &owners,
            Caller {
                uid: 1000,
                privileged: false,
            },
        )
        .unwrap_err();
        assert!(matches!(err, CtlError::OwnershipConflict { .. }));
        assert!(err.to_string().contains("pid=3"));
    }

    #[test]
    fn test_own_processes_pass() {
        let owners = vec![owner(3, 2000)];
        check_ownership(
            &owners,
            Caller {
                uid: 2000,
                privileged: false,
            },
        )
        .unwrap();
    }

    #[test]
    fn test_privileged_caller_passes() {
        let owners = vec![owner(1, 1000), owner(3, 2000)];
        check_ownership(
            &owners,
            Caller {
                uid: 0,
                privileged: true,
            },
        )
        .unwrap();
    }

    #[test]
    fn test_unknown_uid_is_foreign() {
        let owners = vec![Owner {
            pid: 9,
            uid: None,
            resource: "TCP:8088".into(),
        }];
        assert!(check_ownership(
            &owners,
            Caller {
                uid: 1000,
                privileged: false
            }
        )
        .is_err());
    }

    fn resources(dir: &TempDir) -> DaemonResources {
        DaemonResources {
            socket: dir.path().join("goma.ipc"),
            lock: dir.path().join("goma_compiler_proxy.lock.8088"),
            port: "8088".into(),
        }
    }

    #[tokio::test]
    async fn test_absent_socket_short_circuits() {
        let dir = TempDir::new().unwrap();
        let platform = FakePlatform::new();
        platform.set_running(true);

        let pids = find_stakeholders(&platform, &resources(&dir), true)
            .await
            .unwrap();
        assert!(pids.is_empty());
        assert_eq!(platform.owner_queries(), 0);
    }

    #[tokio::test]
    async fn test_full_resolution_checks_ownership() {
        let dir = TempDir::new().unwrap();
        let res = resources(&dir);
        std::fs::write(&res.socket, b"").unwrap();
        std::fs::write(&res.lock, b"").unwrap();

        let platform = FakePlatform::new();
        platform.set_running(true);
        let pids = find_stakeholders(&platform, &res, false).await.unwrap();
        assert_eq!(pids, BTreeSet::from([crate::testing::FAKE_DAEMON_PID]));

        platform.set_owner_uid(Some(4242));
        let err = find_stakeholders(&platform, &res, false).await.unwrap_err();
        assert!(matches!(err, CtlError::OwnershipConflict { .. }));

        // The quick path never validates ownership.
        assert!(find_stakeholders(&platform, &res, true).await.is_ok());
    }
}
