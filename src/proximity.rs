use std::fs;
use std::io;
use std::path::Path;

use log::warn;

use crate::cpumask::CpuMask;
use crate::topology::Numa;

/// One proximity override: a device-address prefix and the CPUs to be
/// considered local to devices under it.
#[derive(Debug)]
pub struct Pxm {
    pub addr: String,
    pub cpumask: CpuMask,
}

/// User-supplied proximity table, loaded once at startup.
///
/// Each non-comment line is `<address-prefix> cpumask <hex-mask>` or
/// `<address-prefix> node <n|-1>`. Lookup is by longest matching prefix.
#[derive(Debug, Default)]
pub struct PxmTable {
    entries: Vec<Pxm>,
}

impl PxmTable {
    pub fn empty() -> Self {
        PxmTable::default()
    }

    /// Parses the proximity config file. An unreadable file is an error
    /// (fatal at startup); malformed lines are logged and skipped.
    pub fn load(path: &Path, numas: &[Numa]) -> io::Result<Self> {
        let text = fs::read_to_string(path)?;
        let mut table = PxmTable::empty();

        for (idx, raw_line) in text.lines().enumerate() {
            let ln = idx + 1;
            let line = match raw_line.find('#') {
                Some(pos) => &raw_line[..pos],
                None => raw_line,
            };
            let mut tokens = line.split_whitespace();
            let Some(addr) = tokens.next() else {
                continue;
            };
            let (Some(cmd), Some(arg)) = (tokens.next(), tokens.next()) else {
                warn!("{}:{ln}: incomplete proximity line", path.display());
                continue;
            };

            let cpumask = if cmd.eq_ignore_ascii_case("cpumask") {
                match arg.parse::<CpuMask>() {
                    Ok(mask) => mask,
                    Err(e) => {
                        warn!("{}:{ln}: {e}", path.display());
                        continue;
                    }
                }
            } else if cmd.eq_ignore_ascii_case("node") {
                let Ok(node) = arg.parse::<i32>() else {
                    warn!("{}:{ln}: bad NUMA node {arg:?}", path.display());
                    continue;
                };
                if node == -1 {
                    // Non-NUMA entry: every CPU is local.
                    CpuMask::all()
                } else {
                    match numas.iter().find(|n| n.id == node as usize) {
                        Some(numa) => numa.cpumap.clone(),
                        None => {
                            warn!("{}:{ln}: unknown NUMA node {node}", path.display());
                            continue;
                        }
                    }
                }
            } else {
                warn!("{}:{ln}: unknown proximity command {cmd:?}", path.display());
                continue;
            };

            table.entries.push(Pxm {
                addr: addr.to_string(),
                cpumask,
            });
        }

        Ok(table)
    }

    /// Longest-prefix lookup: among entries whose `addr` occurs in
    /// `path`, the one with the longest `addr` wins.
    pub fn search(&self, path: &str) -> Option<&CpuMask> {
        let mut best: Option<&Pxm> = None;
        for pxm in &self.entries {
            if !path.contains(&pxm.addr) {
                continue;
            }
            if best.is_none_or(|b| pxm.addr.len() > b.addr.len()) {
                best = Some(pxm);
            }
        }
        best.map(|pxm| &pxm.cpumask)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pxm> {
        self.entries.iter()
    }
}
