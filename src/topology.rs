use log::warn;

use crate::cpumask::{CpuMask, NR_CPUS};
use crate::kernelfs::{read_trimmed, read_u32, KernelFs};

/// Upper bound on NUMA node IDs probed during discovery.
const NR_NUMA_NODES: usize = 256;

/// One logical CPU eligible for IRQs.
#[derive(Debug)]
pub struct Cpu {
    pub id: usize,
    pub package_id: u32,
    pub core_id: u32,
    /// Mask with exactly the bit `id` set; this is what gets written to
    /// `smp_affinity` when an IRQ is moved here.
    pub cpumask: CpuMask,
    /// IRQ load in percent from the latest sample.
    pub load: f64,
    /// Load from the previous sample.
    pub old_load: f64,
    pub(crate) old_load_all: u64,
    pub(crate) old_load_irq: u64,
    /// IRQ numbers currently accounted to this CPU. Rebuilt from kernel
    /// affinity every iteration; the registry owns the records.
    pub irqs: Vec<u32>,
}

impl Cpu {
    fn new(id: usize, package_id: u32, core_id: u32) -> Self {
        Cpu {
            id,
            package_id,
            core_id,
            cpumask: CpuMask::of(id),
            load: 0.0,
            old_load: 0.0,
            old_load_all: 0,
            old_load_irq: 0,
            irqs: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct Numa {
    pub id: usize,
    pub cpumap: CpuMask,
}

/// Enumerates CPUs by probing `cpu0`, `cpu1`, ... until the first missing
/// directory.
///
/// With `ht` disabled, a CPU that shares `(package_id, core_id)` with an
/// already-registered CPU is skipped, but only if its `thread_siblings`
/// mask has two or more bits. Some AMD parts report colliding IDs without
/// sharing execution resources; those stay in.
pub fn scan_cpus(fs: &KernelFs, ht: bool) -> Vec<Cpu> {
    let mut cpus: Vec<Cpu> = Vec::new();

    for id in 0..NR_CPUS {
        if !fs.cpu_dir(id).exists() {
            break;
        }

        let package_id = match read_u32(&fs.cpu_topology(id, "physical_package_id")) {
            Ok(v) => v,
            Err(e) => {
                warn!("cpu{id}: can't read physical_package_id: {e}");
                continue;
            }
        };
        let core_id = match read_u32(&fs.cpu_topology(id, "core_id")) {
            Ok(v) => v,
            Err(e) => {
                warn!("cpu{id}: can't read core_id: {e}");
                continue;
            }
        };

        let thread_siblings = read_trimmed(&fs.cpu_topology(id, "thread_siblings"))
            .ok()
            .and_then(|s| s.parse::<CpuMask>().ok())
            .unwrap_or_else(|| CpuMask::of(id));

        let is_ht_sibling = thread_siblings.weight() >= 2
            && cpus
                .iter()
                .any(|cpu| cpu.package_id == package_id && cpu.core_id == core_id);
        if !ht && is_ht_sibling {
            continue;
        }

        cpus.push(Cpu::new(id, package_id, core_id));
    }

    cpus
}

/// Enumerates NUMA nodes and their member-CPU maps.
pub fn scan_numas(fs: &KernelFs) -> Vec<Numa> {
    let mut numas = Vec::new();

    for id in 0..NR_NUMA_NODES {
        if !fs.node_dir(id).exists() {
            break;
        }

        let cpumap = read_trimmed(&fs.node_cpumap(id))
            .ok()
            .and_then(|s| s.parse::<CpuMask>().ok())
            .unwrap_or_else(CpuMask::all);

        numas.push(Numa { id, cpumap });
    }

    numas
}
