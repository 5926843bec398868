//! Shared fixtures: scripted loopback peripherals.
#![allow(dead_code)] // each test binary uses a different subset

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use instrumentd::rpc::channel::DynSerial;
use instrumentd::rpc::{Device, PortOpener};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Per-device reply policy: `(nth_line, line) -> Option<reply>`. Returning
/// `None` withholds the response (the command times out).
pub type Behavior = Arc<dyn Fn(u64, &str) -> Option<String> + Send + Sync>;

/// Reply `OK` echoing the command's token.
pub fn echo_ok() -> Behavior {
    Arc::new(|_, line| {
        line.split_whitespace()
            .next()
            .map(|token| format!("{} OK\r\n", token))
    })
}

/// Withhold the first `n` replies, then echo `OK`.
pub fn withhold_first(n: u64) -> Behavior {
    Arc::new(move |nth, line| {
        if nth < n {
            None
        } else {
            line.split_whitespace()
                .next()
                .map(|token| format!("{} OK\r\n", token))
        }
    })
}

/// Never reply at all.
pub fn silent() -> Behavior {
    Arc::new(|_, _| None)
}

/// Opener whose simulated peripherals follow a per-device [`Behavior`].
/// Devices without an entry echo `OK`.
pub struct ScriptedOpener {
    behaviors: HashMap<Device, Behavior>,
}

impl ScriptedOpener {
    pub fn new() -> Self {
        Self {
            behaviors: HashMap::new(),
        }
    }

    pub fn with(mut self, device: Device, behavior: Behavior) -> Self {
        self.behaviors.insert(device, behavior);
        self
    }
}

impl Default for ScriptedOpener {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PortOpener for ScriptedOpener {
    async fn open(&self, device: Device) -> anyhow::Result<DynSerial> {
        let behavior = self.behaviors.get(&device).cloned().unwrap_or_else(echo_ok);
        let (ours, theirs) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(theirs);
            let mut lines = BufReader::new(read).lines();
            let mut nth = 0u64;
            while let Ok(Some(line)) = lines.next_line().await {
                let reply = behavior(nth, &line);
                nth += 1;
                if let Some(reply) = reply {
                    if write.write_all(reply.as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
        });
        Ok(Box::new(ours))
    }
}

/// Read the single run CSV produced under `<root>/logs/`.
pub fn read_run_csv(root: &std::path::Path) -> String {
    let logs = root.join("logs");
    let mut csvs: Vec<_> = std::fs::read_dir(&logs)
        .expect("logs directory exists")
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().map(|e| e == "csv").unwrap_or(false))
        .collect();
    csvs.sort();
    assert_eq!(csvs.len(), 1, "expected exactly one run file in {:?}", logs);
    std::fs::read_to_string(&csvs[0]).expect("run file readable")
}

/// Index of the first line whose `kind` column matches, panicking if absent.
pub fn line_index(csv: &str, kind: &str, needle: &str) -> usize {
    csv.lines()
        .position(|line| {
            let mut cols = line.split(',');
            let kind_col = cols.nth(4).unwrap_or("");
            kind_col == kind && line.contains(needle)
        })
        .unwrap_or_else(|| panic!("no '{}' line containing '{}' in:\n{}", kind, needle, csv))
}
