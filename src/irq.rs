use std::collections::BTreeMap;
use std::fs;

use log::{debug, info, warn};

use crate::cpumask::CpuMask;
use crate::kernelfs::{read_trimmed, read_u32, KernelFs};
use crate::proximity::PxmTable;

/// One hardware interrupt line, as tracked between iterations.
///
/// The registry owns every record; CPUs refer to IRQs by number only.
#[derive(Debug)]
pub struct Irq {
    pub irq: u32,
    /// Interrupt chip name from `/proc/interrupts` (e.g. `IO-APIC`).
    pub kind: String,
    /// Trailing description from `/proc/interrupts`.
    pub desc: String,
    /// CPUs topologically local to the owning device. Starts as the full
    /// set and is narrowed by the PCI sysfs walk or a proximity entry.
    pub local_cpus: CpuMask,
    /// The affinity most recently reported by the kernel.
    pub affinity: CpuMask,
    /// The CPU this IRQ is currently accounted to.
    pub cpu: Option<usize>,
    /// Interrupts since the previous sample; zero on the baseline sample.
    pub intr: u64,
    pub(crate) old_intr: u64,
    /// Positive weight defers re-selection, see the balancer.
    pub weight: u32,
    pub(crate) refresh: bool,
    /// Set once the kernel refuses an affinity write; never moved again.
    pub blacklisted: bool,
}

impl Irq {
    fn new(irq: u32) -> Self {
        Irq {
            irq,
            kind: String::new(),
            desc: String::new(),
            local_cpus: CpuMask::all(),
            affinity: CpuMask::new(),
            cpu: None,
            intr: 0,
            old_intr: 0,
            weight: 0,
            refresh: true,
            blacklisted: false,
        }
    }
}

/// All currently-known IRQs, keyed (and iterated) by interrupt number.
pub type IrqRegistry = BTreeMap<u32, Irq>;

/// The decimal IRQ number opening a `/proc/interrupts` line, if this line
/// has one. Lines like `NMI:` or the header row don't.
fn irq_number(line: &str) -> Option<(u32, &str)> {
    let s = line.trim_start();
    let digits_end = s.find(|c: char| !c.is_ascii_digit())?;
    if digits_end == 0 || !s[digits_end..].starts_with(':') {
        return None;
    }
    let num = s[..digits_end].parse().ok()?;
    Some((num, &s[digits_end + 1..]))
}

/// Splits the part of an interrupts line after the colon into the chip
/// name and the trailing description: the chip name is the first
/// alphabetic run after the per-CPU counters, the description everything
/// from the next alphabetic character to the end of the line.
fn kind_and_desc(rest: &str) -> (&str, &str) {
    let Some(kind_start) = rest.find(|c: char| c.is_alphabetic()) else {
        return ("", "");
    };
    let after = &rest[kind_start..];
    let kind_len = after
        .find(|c: char| c == ' ' || c == '\t')
        .unwrap_or(after.len());
    let (kind, tail) = after.split_at(kind_len);

    let desc = match tail.find(|c: char| c.is_alphabetic()) {
        Some(desc_start) => &tail[desc_start..],
        None => "",
    };
    (kind, desc)
}

/// Refreshes the registry from the kernel interrupts file.
///
/// Newly appeared IRQs, and IRQs whose kernel-reported affinity spans
/// more than one CPU, are queued on `balance_irqs` so they receive a
/// placement decision this iteration. Entries that no longer appear in
/// the file are dropped. When anything was queued, the PCI sysfs walk
/// refines each queued IRQ's `local_cpus`.
pub fn scan_irqs(
    kfs: &KernelFs,
    irqs: &mut IrqRegistry,
    balance_irqs: &mut Vec<u32>,
    pxms: &PxmTable,
) {
    let text = match fs::read_to_string(kfs.interrupts()) {
        Ok(text) => text,
        Err(e) => {
            warn!("can't read {}: {e}", kfs.interrupts().display());
            return;
        }
    };

    for line in text.lines() {
        let Some((num, rest)) = irq_number(line) else {
            continue;
        };

        let created = !irqs.contains_key(&num);
        let irq = irqs.entry(num).or_insert_with(|| Irq::new(num));
        irq.refresh = true;
        if irq.blacklisted {
            continue;
        }

        let (kind, desc) = kind_and_desc(rest);
        irq.kind = kind.to_string();
        irq.desc = desc.to_string();

        // Always re-read the current affinity; some arch/driver pairs
        // never switch to the mask we wrote, and stale state here would
        // poison the accounting.
        match read_trimmed(&kfs.smp_affinity(num)).map(|s| s.parse::<CpuMask>()) {
            Ok(Ok(mask)) => irq.affinity = mask,
            Ok(Err(e)) => debug!("IRQ {num}: bad smp_affinity: {e}"),
            Err(e) => debug!("IRQ {num}: can't read smp_affinity: {e}"),
        }

        // A multi-CPU affinity is not a normal state for an IRQ we have
        // already placed; treat it like a new arrival and re-decide.
        if created || irq.affinity.weight() > 1 {
            irq.local_cpus.set_all();
            irq.affinity.set_all();
            balance_irqs.push(num);
            if created {
                info!("Add IRQ {num:3} {}", irq.desc);
            } else {
                debug!("Requeue IRQ {num} (multi-CPU affinity)");
            }
        }
    }

    irqs.retain(|num, irq| {
        if irq.refresh {
            irq.refresh = false;
            true
        } else {
            info!("Remove IRQ {num:3} {}", irq.desc);
            false
        }
    });

    // Nothing new to place means nothing to look up in sysfs.
    if !balance_irqs.is_empty() {
        scan_pci_devices(kfs, irqs, pxms);
    }
}

/// Walks `/sys/bus/pci/devices` and narrows `local_cpus` for every IRQ
/// owned by a device. Devices with an `msi_irqs` directory own the IRQs
/// named there; otherwise the single `irq` file is used. IRQ number 0 is
/// the kernel's "no IRQ" sentinel.
fn scan_pci_devices(kfs: &KernelFs, irqs: &mut IrqRegistry, pxms: &PxmTable) {
    let entries = match fs::read_dir(kfs.pci_devices()) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("can't read {}: {e}", kfs.pci_devices().display());
            return;
        }
    };

    for entry in entries.flatten() {
        let dev_name = entry.file_name().to_string_lossy().into_owned();

        if let Ok(msi) = fs::read_dir(entry.path().join("msi_irqs")) {
            for ment in msi.flatten() {
                if let Ok(num) = ment.file_name().to_string_lossy().parse::<u32>() {
                    if num != 0 {
                        refine_local_cpus(kfs, irqs, pxms, &dev_name, num);
                    }
                }
            }
            continue;
        }

        if let Ok(num) = read_u32(&entry.path().join("irq")) {
            if num != 0 {
                refine_local_cpus(kfs, irqs, pxms, &dev_name, num);
            }
        }
    }
}

fn refine_local_cpus(
    kfs: &KernelFs,
    irqs: &mut IrqRegistry,
    pxms: &PxmTable,
    dev_name: &str,
    num: u32,
) {
    let Some(irq) = irqs.get_mut(&num) else {
        return;
    };

    // A proximity entry overrides whatever the kernel thinks.
    if let Some(mask) = pxms.search(dev_name) {
        irq.local_cpus = mask.clone();
        return;
    }

    let path = kfs.pci_devices().join(dev_name).join("local_cpus");
    if let Ok(Ok(mask)) = read_trimmed(&path).map(|s| s.parse::<CpuMask>()) {
        irq.local_cpus &= &mask;
    }
}
