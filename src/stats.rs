use std::fs;

use log::{debug, warn};

use crate::irq::IrqRegistry;
use crate::kernelfs::KernelFs;
use crate::topology::Cpu;

/// Rebuilds every CPU's IRQ list from the kernel-reported affinity.
///
/// Affinity writes are not reliable on all arch/driver combinations, so
/// the mask read back from the kernel is the authoritative owner for
/// accounting. IRQs whose affinity spans several CPUs stay unassigned;
/// discovery has already queued them for a fresh placement.
pub fn link_irqs_to_cpus(cpus: &mut [Cpu], irqs: &mut IrqRegistry) {
    for cpu in cpus.iter_mut() {
        cpu.irqs.clear();
    }

    for (num, irq) in irqs.iter_mut() {
        irq.cpu = None;
        if irq.blacklisted {
            continue;
        }
        if irq.affinity.weight() != 1 {
            continue;
        }
        let Some(id) = irq.affinity.first() else {
            continue;
        };
        let Some(cpu) = cpus.iter_mut().find(|c| c.id == id) else {
            continue;
        };
        irq.cpu = Some(id);
        cpu.irqs.push(*num);
    }
}

/// Samples `/proc/stat`: per-CPU IRQ-load percentages from the jiffy
/// counters, and per-IRQ interrupt deltas from the `intr` line.
///
/// The first sample only establishes the baseline; loads and deltas stay
/// zero until the second sample.
pub fn gather_statistics(kfs: &KernelFs, cpus: &mut [Cpu], irqs: &mut IrqRegistry) {
    let text = match fs::read_to_string(kfs.stat()) {
        Ok(text) => text,
        Err(e) => {
            warn!("can't read {}: {e}", kfs.stat().display());
            return;
        }
    };

    for line in text.lines() {
        let mut tokens = line.split_whitespace();
        let Some(label) = tokens.next() else {
            continue;
        };

        if let Some(nr) = label.strip_prefix("cpu").and_then(|s| s.parse::<usize>().ok()) {
            let Some(cpu) = cpus.iter_mut().find(|c| c.id == nr) else {
                continue;
            };

            // user nice system idle iowait irq softirq steal guest guest_nice
            let jiffies: Vec<u64> = tokens
                .take(10)
                .map(|t| t.parse().unwrap_or(0))
                .collect();
            if jiffies.len() < 4 {
                continue;
            }
            let load_all: u64 = jiffies.iter().sum();
            let load_irq = jiffies.get(5).copied().unwrap_or(0)
                + jiffies.get(6).copied().unwrap_or(0);

            cpu.old_load = cpu.load;
            if cpu.old_load_all == 0 {
                // Baseline sample.
                cpu.load = 0.0;
            } else {
                let d_all = load_all.saturating_sub(cpu.old_load_all);
                let d_irq = load_irq.saturating_sub(cpu.old_load_irq);
                cpu.load = if d_all == 0 {
                    0.0
                } else {
                    d_irq as f64 * 100.0 / d_all as f64
                };
            }
            cpu.old_load_all = load_all;
            cpu.old_load_irq = load_irq;
        } else if label == "intr" {
            // First value is the grand total; the rest are cumulative
            // counters indexed by IRQ number starting at 0.
            for (inum, token) in tokens.skip(1).enumerate() {
                let Some(irq) = irqs.get_mut(&(inum as u32)) else {
                    continue;
                };
                let current: u64 = token.parse().unwrap_or(0);
                if irq.old_intr == 0 {
                    irq.intr = 0;
                } else {
                    irq.intr = current.saturating_sub(irq.old_intr);
                }
                irq.old_intr = current;
            }
        }
    }
}

/// Logs the per-CPU picture; with `verbose`, each CPU's IRQs too.
pub fn show_statistics(cpus: &[Cpu], irqs: &IrqRegistry, verbose: bool) {
    for cpu in cpus {
        debug!(
            "CPU{} package {}, core {}, irqs {}, old {:.2}%, load {:.2}%",
            cpu.id,
            cpu.package_id,
            cpu.core_id,
            cpu.irqs.len(),
            cpu.old_load,
            cpu.load
        );
        if !verbose {
            continue;
        }
        for num in &cpu.irqs {
            if let Some(irq) = irqs.get(num) {
                debug!(
                    "    IRQ {num:3}, [{}], weight {}, intr {}, {}",
                    irq.affinity.pretty(),
                    irq.weight,
                    irq.intr,
                    irq.desc
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs as stdfs;
    use std::path::Path;

    use tempfile::TempDir;

    use super::*;
    use crate::cpumask::CpuMask;
    use crate::proximity::PxmTable;

    fn fake_cpus(n: usize) -> Vec<Cpu> {
        let tmp = TempDir::new().unwrap();
        let sys = tmp.path();
        for id in 0..n {
            let dir = sys.join(format!("devices/system/cpu/cpu{id}/topology"));
            stdfs::create_dir_all(&dir).unwrap();
            stdfs::write(dir.join("physical_package_id"), "0\n").unwrap();
            stdfs::write(dir.join("core_id"), format!("{id}\n")).unwrap();
            stdfs::write(dir.join("thread_siblings"), format!("{:08x}\n", 1u32 << id)).unwrap();
        }
        crate::topology::scan_cpus(&KernelFs::with_roots(sys.join("proc"), sys), false)
    }

    fn registry_from_interrupts(proc_dir: &Path, kfs: &KernelFs, body: &str) -> IrqRegistry {
        stdfs::create_dir_all(proc_dir).unwrap();
        stdfs::write(proc_dir.join("interrupts"), body).unwrap();
        let mut irqs = IrqRegistry::new();
        let mut balance = Vec::new();
        crate::irq::scan_irqs(kfs, &mut irqs, &mut balance, &PxmTable::empty());
        irqs
    }

    #[test]
    fn relink_follows_single_bit_affinity() {
        let mut cpus = fake_cpus(2);
        let tmp = TempDir::new().unwrap();
        let proc_dir = tmp.path().join("proc");
        let fs = KernelFs::with_roots(&proc_dir, tmp.path().join("sys"));
        let mut irqs = registry_from_interrupts(
            &proc_dir,
            &fs,
            "16:  1  2  IO-APIC  16-fasteoi  ehci_hcd\n\
             17:  3  4  IO-APIC  17-fasteoi  snd\n\
             18:  5  6  IO-APIC  18-fasteoi  uhci\n",
        );

        irqs.get_mut(&16).unwrap().affinity = CpuMask::of(0);
        irqs.get_mut(&17).unwrap().affinity = CpuMask::of(1);
        // Multi-CPU affinity stays unassigned.
        irqs.get_mut(&18).unwrap().affinity = "00000003".parse().unwrap();

        link_irqs_to_cpus(&mut cpus, &mut irqs);
        assert_eq!(cpus[0].irqs, vec![16]);
        assert_eq!(cpus[1].irqs, vec![17]);
        assert_eq!(irqs[&16].cpu, Some(0));
        assert_eq!(irqs[&18].cpu, None);

        // Blacklisted IRQs never appear on a CPU list.
        irqs.get_mut(&16).unwrap().blacklisted = true;
        link_irqs_to_cpus(&mut cpus, &mut irqs);
        assert!(cpus[0].irqs.is_empty());
        assert_eq!(irqs[&16].cpu, None);
    }

    #[test]
    fn first_sample_is_a_baseline() {
        let mut cpus = fake_cpus(2);
        let tmp = TempDir::new().unwrap();
        let proc_dir = tmp.path().join("proc");
        stdfs::create_dir_all(&proc_dir).unwrap();
        let fs = KernelFs::with_roots(&proc_dir, tmp.path().join("sys"));
        let mut irqs = IrqRegistry::new();

        stdfs::write(
            proc_dir.join("stat"),
            "cpu  200 0 0 600 0 100 100 0 0 0\n\
             cpu0 100 0 0 300 0 50 50 0 0 0\n\
             cpu1 100 0 0 300 0 50 50 0 0 0\n\
             intr 1000 10 20\n",
        )
        .unwrap();

        gather_statistics(&fs, &mut cpus, &mut irqs);
        assert_eq!(cpus[0].load, 0.0);
        assert_eq!(cpus[1].load, 0.0);
        assert_eq!(cpus[0].old_load_all, 500);
        assert_eq!(cpus[0].old_load_irq, 100);
    }

    #[test]
    fn second_sample_computes_loads_and_deltas() {
        let mut cpus = fake_cpus(2);
        let tmp = TempDir::new().unwrap();
        let proc_dir = tmp.path().join("proc");
        let fs = KernelFs::with_roots(&proc_dir, tmp.path().join("sys"));
        let mut irqs = registry_from_interrupts(
            &proc_dir,
            &fs,
            "0:  1  2  IO-APIC  2-edge  timer\n\
             1:  3  4  IO-APIC  1-edge  i8042\n",
        );

        stdfs::write(
            proc_dir.join("stat"),
            "cpu  200 0 0 600 0 100 100 0 0 0\n\
             cpu0 100 0 0 300 0 50 50 0 0 0\n\
             cpu1 100 0 0 300 0 50 50 0 0 0\n\
             intr 1000 100 200\n",
        )
        .unwrap();
        gather_statistics(&fs, &mut cpus, &mut irqs);
        assert_eq!(irqs[&0].intr, 0);

        stdfs::write(
            proc_dir.join("stat"),
            "cpu  400 0 0 1200 0 300 300 0 0 0\n\
             cpu0 150 0 0 550 0 150 150 0 0 0\n\
             cpu1 200 0 0 700 0 50 50 0 0 0\n\
             intr 2000 1100 205\n",
        )
        .unwrap();
        gather_statistics(&fs, &mut cpus, &mut irqs);

        // cpu0: d_all = 500, d_irq = 200 -> 40%.
        assert!((cpus[0].load - 40.0).abs() < 1e-9);
        // cpu1: d_all = 400, d_irq = 0 -> 0%.
        assert_eq!(cpus[1].load, 0.0);
        assert_eq!(cpus[0].old_load, 0.0);

        assert_eq!(irqs[&0].intr, 1000);
        assert_eq!(irqs[&1].intr, 5);
    }

    #[test]
    fn counter_reset_yields_zero_delta() {
        let mut cpus = fake_cpus(1);
        let tmp = TempDir::new().unwrap();
        let proc_dir = tmp.path().join("proc");
        let fs = KernelFs::with_roots(&proc_dir, tmp.path().join("sys"));
        let mut irqs =
            registry_from_interrupts(&proc_dir, &fs, "0:  1  IO-APIC  2-edge  timer\n");

        for counters in ["intr 500 400\n", "intr 600 100\n"] {
            stdfs::write(
                proc_dir.join("stat"),
                format!("cpu  1 0 0 1 0 0 0 0 0 0\ncpu0 1 0 0 1 0 0 0 0 0 0\n{counters}"),
            )
            .unwrap();
            gather_statistics(&fs, &mut cpus, &mut irqs);
        }

        // The cumulative counter went backwards; don't underflow.
        assert_eq!(irqs[&0].intr, 0);
        assert_eq!(irqs[&0].old_intr, 100);
    }
}
