use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;

use clap::ValueEnum;
use log::{info, warn};
use rand::Rng;
use rand::RngExt;

use crate::cpumask::CpuMask;
use crate::irq::IrqRegistry;
use crate::kernelfs::KernelFs;
use crate::topology::Cpu;

/// How to pick the IRQ to evict from an overloaded CPU.
///
/// A very small interrupt delta means the IRQ is idle; a very large one
/// can mean a NAPI-polled NIC where moving the IRQ buys nothing. `Max`
/// targets the most visible offender, `Min` the most easily evicted,
/// `Rnd` avoids oscillating between two heavy IRQs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Strategy {
    /// Move the IRQ with the most interrupts since the last sample.
    Max,
    /// Move the IRQ with the fewest interrupts since the last sample.
    Min,
    /// Move a uniformly random eligible IRQ.
    Rnd,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.to_possible_value()
            .expect("no values are skipped")
            .get_name()
            .fmt(f)
    }
}

/// Subtracts `value` from the weight of every IRQ on `cpu`, flooring
/// at zero.
fn dec_weight(cpu: &Cpu, irqs: &mut IrqRegistry, value: u32) {
    for num in &cpu.irqs {
        if let Some(irq) = irqs.get_mut(num) {
            irq.weight = irq.weight.saturating_sub(value);
        }
    }
}

/// Detaches an IRQ from the CPU it is accounted to.
pub fn remove_irq_from_cpu(cpus: &mut [Cpu], irqs: &mut IrqRegistry, num: u32) {
    let Some(irq) = irqs.get_mut(&num) else {
        return;
    };
    let Some(cpu_id) = irq.cpu.take() else {
        return;
    };
    if let Some(cpu) = cpus.iter_mut().find(|c| c.id == cpu_id) {
        cpu.irqs.retain(|&n| n != num);
    }
}

/// Moves an IRQ onto `dst_id`, detaching it from its old CPU first.
/// Weights of the IRQs on both endpoint CPUs decay by one, so a
/// recently-frozen IRQ thaws after a bounded number of migrations.
pub fn move_irq_to_cpu(cpus: &mut [Cpu], irqs: &mut IrqRegistry, num: u32, dst_id: usize) {
    let old_id = irqs.get(&num).and_then(|irq| irq.cpu);
    if let Some(old_id) = old_id {
        if let Some(old_pos) = cpus.iter().position(|c| c.id == old_id) {
            cpus[old_pos].irqs.retain(|&n| n != num);
            dec_weight(&cpus[old_pos], irqs, 1);
        }
    }

    let Some(dst_pos) = cpus.iter().position(|c| c.id == dst_id) else {
        return;
    };
    dec_weight(&cpus[dst_pos], irqs, 1);
    cpus[dst_pos].irqs.push(num);
    if let Some(irq) = irqs.get_mut(&num) {
        irq.cpu = Some(dst_id);
    }
}

/// The best destination within `mask`: lowest load under `threshold`,
/// ties broken by the fewest currently-assigned IRQs.
fn choose_cpu(cpus: &[Cpu], mask: &CpuMask, threshold: f64) -> Option<usize> {
    let mut best: Option<&Cpu> = None;
    for cpu in cpus {
        if !mask.contains(cpu.id) {
            continue;
        }
        if cpu.load >= threshold {
            continue;
        }
        let better = match best {
            None => true,
            Some(b) => {
                cpu.load < b.load || (cpu.load == b.load && cpu.irqs.len() < b.irqs.len())
            }
        };
        if better {
            best = Some(cpu);
        }
    }
    best.map(|cpu| cpu.id)
}

/// Minimum weight and count over the IRQs on a CPU that actually fired
/// since the last sample.
fn irq_list_info(cpu: &Cpu, irqs: &IrqRegistry) -> (Option<u32>, usize) {
    let mut min_weight: Option<u32> = None;
    let mut live = 0;
    for num in &cpu.irqs {
        let Some(irq) = irqs.get(num) else {
            continue;
        };
        if irq.intr == 0 {
            continue;
        }
        live += 1;
        min_weight = Some(match min_weight {
            None => irq.weight,
            Some(w) => w.min(irq.weight),
        });
    }
    (min_weight, live)
}

/// The CPU to try to relieve: greatest load at or above `threshold`,
/// carrying at least two IRQs of which at least one actually fired.
/// Visiting a candidate decays its IRQ weights by the minimum weight
/// present, so IRQs frozen by an earlier migration thaw here.
fn most_overloaded_cpu(cpus: &mut [Cpu], irqs: &mut IrqRegistry, threshold: f64) -> Option<usize> {
    let mut best = None;
    let mut max_load = 0.0;

    for i in 0..cpus.len() {
        let cpu = &cpus[i];
        if cpu.load < threshold {
            continue;
        }
        if cpu.load <= max_load {
            continue;
        }
        // Never empty a CPU entirely.
        if cpu.irqs.len() <= 1 {
            continue;
        }
        let (min_weight, live) = irq_list_info(cpu, irqs);
        // Nothing is actually interrupting here; the load is softirq
        // backlog we can't help with.
        if live == 0 {
            continue;
        }
        let max_load_here = cpu.load;
        if let Some(w) = min_weight {
            if w > 0 {
                dec_weight(&cpus[i], irqs, w);
            }
        }
        max_load = max_load_here;
        best = Some(i);
    }

    best
}

/// Picks at most one IRQ to migrate this iteration and appends it to
/// `balance_irqs`. The chosen IRQ gets `weight = 1` so it is not picked
/// again next iteration.
pub fn choose_irqs_to_move<R: Rng>(
    cpus: &mut [Cpu],
    irqs: &mut IrqRegistry,
    balance_irqs: &mut Vec<u32>,
    threshold: f64,
    strategy: Strategy,
    rng: &mut R,
) {
    let Some(idx) = most_overloaded_cpu(cpus, irqs, threshold) else {
        return;
    };
    let cpu = &cpus[idx];

    let chosen: Option<u32> = match strategy {
        Strategy::Max | Strategy::Min => {
            let mut best: Option<(u32, u64)> = None;
            for num in &cpu.irqs {
                let Some(irq) = irqs.get(num) else {
                    continue;
                };
                if irq.intr == 0 || irq.weight != 0 {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some((_, intr)) => match strategy {
                        Strategy::Max => irq.intr > intr,
                        _ => irq.intr < intr,
                    },
                };
                if better {
                    best = Some((*num, irq.intr));
                }
            }
            best.map(|(num, _)| num)
        }
        Strategy::Rnd => {
            let eligible: Vec<u32> = cpu
                .irqs
                .iter()
                .filter(|num| {
                    irqs.get(*num)
                        .is_some_and(|irq| irq.intr > 0 && irq.weight == 0)
                })
                .copied()
                .collect();
            if eligible.is_empty() {
                None
            } else {
                Some(eligible[rng.random_range(0..eligible.len())])
            }
        }
    };

    if let Some(num) = chosen {
        // Don't move this one again next iteration.
        if let Some(irq) = irqs.get_mut(&num) {
            irq.weight = 1;
        }
        balance_irqs.push(num);
    }
}

/// Finds a destination CPU for every queued IRQ and performs the moves.
///
/// The destination must be local to the IRQ's device. With `non_local`
/// set, an IRQ whose local CPUs are all overloaded may fall back to the
/// complement; traffic then crosses the socket interconnect, which is
/// rarely a win, hence the default of off.
pub fn balance(
    cpus: &mut [Cpu],
    irqs: &mut IrqRegistry,
    balance_irqs: &[u32],
    threshold: f64,
    non_local: bool,
) {
    for &num in balance_irqs {
        let Some(irq) = irqs.get(&num) else {
            continue;
        };
        let mut target = choose_cpu(cpus, &irq.local_cpus, threshold);
        if target.is_none() && non_local {
            target = choose_cpu(cpus, &!&irq.local_cpus, threshold);
        }
        let Some(dst) = target else {
            continue;
        };
        match irq.cpu {
            Some(old) => info!("Move IRQ {num} from CPU{old} to CPU{dst}"),
            None => info!("Move IRQ {num} to CPU{dst}"),
        }
        move_irq_to_cpu(cpus, irqs, num, dst);
    }
}

fn write_affinity(fs: &KernelFs, num: u32, mask: &CpuMask) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_SYNC)
        .open(fs.smp_affinity(num))?;
    file.write_all(mask.to_string().as_bytes())
}

/// Pushes the decided affinities to the kernel. Any failure is taken as
/// the kernel refusing this IRQ (the timer IRQ 0 is the classic case):
/// the IRQ is blacklisted and drops out of accounting for good.
pub fn apply_affinity(fs: &KernelFs, cpus: &mut [Cpu], irqs: &mut IrqRegistry, balance_irqs: &[u32]) {
    for &num in balance_irqs {
        let Some(irq) = irqs.get(&num) else {
            continue;
        };
        let Some(cpu_id) = irq.cpu else {
            continue;
        };
        let Some(cpu) = cpus.iter().find(|c| c.id == cpu_id) else {
            continue;
        };
        let mask = cpu.cpumask.clone();
        if let Err(e) = write_affinity(fs, num, &mask) {
            warn!("can't set affinity of IRQ {num} to {mask}: {e}");
            info!("Blacklist IRQ {num}");
            remove_irq_from_cpu(cpus, irqs, num);
            if let Some(irq) = irqs.get_mut(&num) {
                irq.blacklisted = true;
            }
        }
    }
}
