//! Candidate sources. Both read masscan's JSON output, either live from its
//! stdout or from a file left over from an earlier scan.

use std::{net::IpAddr, process::Stdio, sync::Arc};

use eyre::eyre;
use serde::Deserialize;
use tokio::{
    fs::File,
    io::{AsyncBufRead, AsyncBufReadExt, BufReader},
    process::{Child, Command},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use super::{Candidate, CandidateSender};
use crate::exclude::Ipv4Ranges;

#[derive(Deserialize)]
struct MasscanResult {
    ip: IpAddr,
    #[serde(default)]
    ports: Vec<MasscanPort>,
}

#[derive(Deserialize)]
struct MasscanPort {
    port: u16,
}

/// Parse one line of `masscan -oJ` output. Masscan writes a JSON array with one
/// object per line, so the brackets and trailing commas have to be skipped.
pub fn parse_masscan_line(line: &str) -> Vec<Candidate> {
    let line = line.trim();
    if line.len() < 10 || line.starts_with('[') || line.starts_with(']') {
        return Vec::new();
    }
    let line = line.strip_suffix(',').unwrap_or(line);

    match serde_json::from_str::<MasscanResult>(line) {
        Ok(result) => result
            .ports
            .into_iter()
            .map(|p| Candidate::new(result.ip, p.port))
            .collect(),
        Err(err) => {
            debug!("ignoring masscan line {line:?}: {err}");
            Vec::new()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub forwarded: usize,
    pub excluded: usize,
}

/// Send every candidate in the reader to the pipeline, skipping excluded
/// addresses. Stops early if the pipeline went away. A read error ends the
/// source but keeps whatever was already sent, so the pipeline still drains
/// normally once the sender is dropped.
pub async fn forward_candidates<R: AsyncBufRead + Unpin>(
    mut reader: R,
    source: &str,
    sender: &CandidateSender,
    exclude: &Ipv4Ranges,
) -> SourceStats {
    let mut stats = SourceStats::default();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                error!("error reading {source}: {err}");
                break;
            }
        }
        // a corrupt line shouldn't cost us everything after it
        let line = String::from_utf8_lossy(&buf);
        for candidate in parse_masscan_line(&line) {
            if is_excluded(exclude, candidate.ip) {
                stats.excluded += 1;
                continue;
            }
            if sender.send(candidate).await.is_err() {
                warn!("pipeline closed before {source} was done");
                return stats;
            }
            stats.forwarded += 1;
        }
    }
    stats
}

fn is_excluded(exclude: &Ipv4Ranges, ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => exclude.contains(ip),
        // exclude files are ipv4 only
        IpAddr::V6(_) => false,
    }
}

#[derive(Debug, Clone)]
pub struct MasscanSource {
    pub masscan_path: String,
    pub range: String,
    pub ports: Vec<u16>,
    pub rate: u64,
    pub exclude_file: Option<String>,
}

impl MasscanSource {
    pub fn args(&self) -> Vec<String> {
        let ports = self
            .ports
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let mut args = vec![
            self.range.clone(),
            format!("-p{ports}"),
            "--rate".to_string(),
            self.rate.to_string(),
            // never scan broadcast
            "--exclude".to_string(),
            "255.255.255.255".to_string(),
            "-oJ".to_string(),
            "-".to_string(),
        ];
        if let Some(exclude_file) = &self.exclude_file {
            args.push("--excludefile".to_string());
            args.push(exclude_file.clone());
        }
        args
    }

    /// Launch masscan and feed its results to the pipeline in the background.
    /// If masscan can't be started at all this returns an error right away.
    /// Anything that goes wrong after that is only logged, and the sender is
    /// dropped so the pipeline can finish normally.
    pub fn spawn(
        &self,
        sender: CandidateSender,
        exclude: Arc<Ipv4Ranges>,
    ) -> eyre::Result<JoinHandle<SourceStats>> {
        let args = self.args();
        info!("running {} {}", self.masscan_path, args.join(" "));

        let mut child = Command::new(&self.masscan_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| eyre!("couldn't start {}: {err}", self.masscan_path))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| eyre!("masscan has no stdout"))?;

        Ok(tokio::spawn(async move {
            let stats =
                forward_candidates(BufReader::new(stdout), "masscan output", &sender, &exclude).await;
            drop(sender);
            wait_for_exit(child).await;
            info!(
                "masscan is done, {} candidates ({} excluded)",
                stats.forwarded, stats.excluded
            );
            stats
        }))
    }
}

async fn wait_for_exit(mut child: Child) {
    match child.wait().await {
        Ok(status) if status.success() => {}
        Ok(status) => warn!("masscan exited with {status}"),
        Err(err) => error!("couldn't wait for masscan: {err}"),
    }
}

/// Reads candidates from saved `masscan -oJ` output.
#[derive(Debug, Clone)]
pub struct FileSource {
    pub path: String,
}

impl FileSource {
    pub async fn spawn(
        &self,
        sender: CandidateSender,
        exclude: Arc<Ipv4Ranges>,
    ) -> eyre::Result<JoinHandle<SourceStats>> {
        let file = File::open(&self.path)
            .await
            .map_err(|err| eyre!("couldn't open {}: {err}", self.path))?;
        let path = self.path.clone();

        Ok(tokio::spawn(async move {
            let stats = forward_candidates(BufReader::new(file), &path, &sender, &exclude).await;
            if stats.forwarded == 0 && stats.excluded == 0 {
                // only one object per line is understood, like masscan -oJ writes it
                warn!("no candidates in {path}, is it masscan -oJ output?");
            }
            info!(
                "read {} candidates from {path} ({} excluded)",
                stats.forwarded, stats.excluded
            );
            stats
        }))
    }
}
