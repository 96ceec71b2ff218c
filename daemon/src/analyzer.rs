//! Optional deep inspection of matched processes

use crate::record::ProcessRecord;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Fire-and-forget: the manager never waits on, or reacts to, an analysis.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, record: Arc<ProcessRecord>);
}

/// Logs the shared objects a matched process has mapped.
pub struct LibraryAnalyzer;

impl LibraryAnalyzer {
    pub fn libraries(maps: &str) -> BTreeSet<String> {
        maps.lines()
            .filter_map(|line| line.split_whitespace().nth(5))
            .filter(|path| path.contains(".so"))
            .map(|path| path.to_string())
            .collect()
    }
}

#[async_trait]
impl Analyzer for LibraryAnalyzer {
    async fn analyze(&self, record: Arc<ProcessRecord>) {
        let maps = match tokio::fs::read_to_string(format!("/proc/{}/maps", record.pid)).await {
            Ok(maps) => maps,
            Err(e) => {
                debug!(pid = record.pid, "analysis skipped: {}", e);
                return;
            }
        };
        let libraries = Self::libraries(&maps);
        debug!(
            pid = record.pid,
            name = %record.name,
            "{} shared libraries: {:?}",
            libraries.len(),
            libraries
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_shared_objects() {
        let maps = "\
7f00-7f01 r-xp 00000000 08:01 123 /usr/lib/libc.so.6
7f01-7f02 r--p 00000000 08:01 123 /usr/lib/libc.so.6
7f02-7f03 rw-p 00000000 00:00 0
7f03-7f04 r-xp 00000000 08:01 456 /usr/bin/game
";
        let libs = LibraryAnalyzer::libraries(maps);
        assert_eq!(libs.len(), 1);
        assert!(libs.contains("/usr/lib/libc.so.6"));
    }
}
