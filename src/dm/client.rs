//! `dmsetup(8)` client
//!
//! The engine never talks to `/dev/mapper` or the ioctl interface directly;
//! it shells out to `dmsetup`, same as the reference tool this engine is
//! modeled on. [`DmClient`] is the seam: production code uses
//! [`DmSetupClient`], tests can swap in an in-memory fake.

use execute::Execute;
use std::process::{Command, Stdio};

use crate::core::{EraError, Result};

/// One line of a device-mapper table: `start length target_type params`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmTarget {
    pub start: u64,
    pub length: u64,
    pub target_type: String,
    pub params: String,
}

impl DmTarget {
    pub fn new(start: u64, length: u64, target_type: impl Into<String>, params: impl Into<String>) -> Self {
        Self {
            start,
            length,
            target_type: target_type.into(),
            params: params.into(),
        }
    }

    fn to_line(&self) -> String {
        format!("{} {} {} {}", self.start, self.length, self.target_type, self.params)
    }
}

/// Subset of `dmsetup info` this engine needs to decide whether it's safe
/// to reload or remove a device.
#[derive(Debug, Clone, Copy, Default)]
pub struct DmInfo {
    pub exists: bool,
    pub suspended: bool,
    pub open_count: u32,
    pub target_count: u32,
    pub major: u32,
    pub minor: u32,
}

/// The device-mapper operations the orchestrator drives. Implemented by
/// [`DmSetupClient`] in production; tests use an in-memory fake.
pub trait DmClient: Send + Sync {
    fn create(&self, name: &str, table: &[DmTarget]) -> Result<()>;
    fn reload(&self, name: &str, table: &[DmTarget]) -> Result<()>;
    fn suspend(&self, name: &str) -> Result<()>;
    fn resume(&self, name: &str) -> Result<()>;
    fn remove(&self, name: &str) -> Result<()>;
    /// Sends a target message; returns the reply line if the target sent one.
    fn message(&self, name: &str, sector: u64, msg: &str) -> Result<Option<String>>;
    fn info(&self, name: &str) -> Result<DmInfo>;
    fn table(&self, name: &str) -> Result<Vec<DmTarget>>;
    fn status(&self, name: &str) -> Result<String>;
    fn list(&self) -> Result<Vec<String>>;
}

/// Shells out to the real `dmsetup` binary.
pub struct DmSetupClient {
    binary: String,
}

impl Default for DmSetupClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DmSetupClient {
    pub fn new() -> Self {
        Self {
            binary: "dmsetup".to_string(),
        }
    }

    /// Overrides the binary name/path, for environments where `dmsetup`
    /// isn't on `PATH`.
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let mut command = Command::new(&self.binary);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let output = command.execute_output().map_err(EraError::Io)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EraError::Busy(format!(
                "dmsetup {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl DmClient for DmSetupClient {
    fn create(&self, name: &str, table: &[DmTarget]) -> Result<()> {
        let table_text = table.iter().map(DmTarget::to_line).collect::<Vec<_>>().join("\n");
        let mut command = Command::new(&self.binary);
        command.args(["create", name, "--table", &table_text]);
        let status = command.execute().map_err(EraError::Io)?;
        match status {
            Some(status) if status.success() => Ok(()),
            Some(status) => Err(EraError::Busy(format!(
                "dmsetup create {} exited with status {:?}",
                name,
                status.code()
            ))),
            None => Err(EraError::Io(std::io::Error::other(
                "dmsetup create produced no exit status",
            ))),
        }
    }

    fn reload(&self, name: &str, table: &[DmTarget]) -> Result<()> {
        let table_text = table.iter().map(DmTarget::to_line).collect::<Vec<_>>().join("\n");
        self.run(&["reload", name, "--table", &table_text]).map(|_| ())
    }

    fn suspend(&self, name: &str) -> Result<()> {
        self.run(&["suspend", name]).map(|_| ())
    }

    fn resume(&self, name: &str) -> Result<()> {
        self.run(&["resume", name]).map(|_| ())
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.run(&["remove", name]).map(|_| ())
    }

    fn message(&self, name: &str, sector: u64, msg: &str) -> Result<Option<String>> {
        let sector_str = sector.to_string();
        let out = self.run(&["message", name, &sector_str, msg])?;
        let trimmed = out.trim();
        if trimmed.is_empty() {
            Ok(None)
        } else {
            Ok(Some(trimmed.to_string()))
        }
    }

    fn info(&self, name: &str) -> Result<DmInfo> {
        match self.run(&[
            "info",
            "-c",
            "--noheadings",
            "-o",
            "suspended,open,segments,major,minor",
            "--separator",
            ":",
            name,
        ]) {
            Ok(out) => {
                let line = out.trim();
                let mut fields = line.split(':');
                let suspended = fields.next().unwrap_or("") == "Suspended";
                let open_count = fields.next().unwrap_or("0").trim().parse().unwrap_or(0);
                let target_count = fields.next().unwrap_or("0").trim().parse().unwrap_or(0);
                let major = fields.next().unwrap_or("0").trim().parse().unwrap_or(0);
                let minor = fields.next().unwrap_or("0").trim().parse().unwrap_or(0);
                Ok(DmInfo {
                    exists: true,
                    suspended,
                    open_count,
                    target_count,
                    major,
                    minor,
                })
            }
            Err(EraError::Busy(_)) => Ok(DmInfo::default()),
            Err(e) => Err(e),
        }
    }

    fn table(&self, name: &str) -> Result<Vec<DmTarget>> {
        let out = self.run(&["table", name])?;
        parse_table(&out)
    }

    fn status(&self, name: &str) -> Result<String> {
        let out = self.run(&["status", name])?;
        Ok(out.lines().next().unwrap_or("").to_string())
    }

    fn list(&self) -> Result<Vec<String>> {
        let out = self.run(&["ls", "--exec", "echo"])?;
        Ok(out.lines().map(|l| l.to_string()).collect())
    }
}

fn parse_table(text: &str) -> Result<Vec<DmTarget>> {
    let mut targets = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(4, ' ');
        let start: u64 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| EraError::Corrupt(format!("malformed dmsetup table line: {}", line)))?;
        let length: u64 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| EraError::Corrupt(format!("malformed dmsetup table line: {}", line)))?;
        let target_type = parts
            .next()
            .ok_or_else(|| EraError::Corrupt(format!("malformed dmsetup table line: {}", line)))?
            .to_string();
        let params = parts.next().unwrap_or("").to_string();
        targets.push(DmTarget {
            start,
            length,
            target_type,
            params,
        });
    }
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dm_target_to_line() {
        let t = DmTarget::new(0, 2048, "era", "/dev/md /dev/data 128");
        assert_eq!(t.to_line(), "0 2048 era /dev/md /dev/data 128");
    }

    #[test]
    fn test_parse_table_multiple_targets() {
        let text = "0 100 linear /dev/sda 0\n100 50 error\n";
        let targets = parse_table(text).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].target_type, "linear");
        assert_eq!(targets[1].start, 100);
        assert_eq!(targets[1].length, 50);
    }

    #[test]
    fn test_parse_table_rejects_malformed_line() {
        let text = "not-a-number 100 linear /dev/sda 0\n";
        assert!(parse_table(text).is_err());
    }
}
