use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Locations of the kernel interfaces the daemon reads and writes.
///
/// Production code uses [`KernelFs::host`]; tests point the roots at a
/// tempdir populated with fake `/proc` and `/sys` trees.
#[derive(Clone, Debug)]
pub struct KernelFs {
    proc_root: PathBuf,
    sys_root: PathBuf,
}

impl KernelFs {
    pub fn host() -> Self {
        KernelFs::with_roots("/proc", "/sys")
    }

    pub fn with_roots(proc_root: impl Into<PathBuf>, sys_root: impl Into<PathBuf>) -> Self {
        KernelFs {
            proc_root: proc_root.into(),
            sys_root: sys_root.into(),
        }
    }

    pub fn interrupts(&self) -> PathBuf {
        self.proc_root.join("interrupts")
    }

    pub fn stat(&self) -> PathBuf {
        self.proc_root.join("stat")
    }

    pub fn smp_affinity(&self, irq: u32) -> PathBuf {
        self.proc_root.join(format!("irq/{irq}/smp_affinity"))
    }

    pub fn cpu_dir(&self, id: usize) -> PathBuf {
        self.sys_root.join(format!("devices/system/cpu/cpu{id}"))
    }

    pub fn cpu_topology(&self, id: usize, attr: &str) -> PathBuf {
        self.cpu_dir(id).join("topology").join(attr)
    }

    pub fn node_dir(&self, id: usize) -> PathBuf {
        self.sys_root.join(format!("devices/system/node/node{id}"))
    }

    pub fn node_cpumap(&self, id: usize) -> PathBuf {
        self.node_dir(id).join("cpumap")
    }

    pub fn pci_devices(&self) -> PathBuf {
        self.sys_root.join("bus/pci/devices")
    }
}

/// Reads a small kernel-exported file, trimming the trailing newline.
pub fn read_trimmed(path: &Path) -> io::Result<String> {
    Ok(fs::read_to_string(path)?.trim().to_string())
}

/// Reads a file holding a single decimal integer.
pub fn read_u32(path: &Path) -> io::Result<u32> {
    read_trimmed(path)?
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
