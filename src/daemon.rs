use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM, SIGUSR1};

use crate::balance::{apply_affinity, balance, choose_irqs_to_move, Strategy};
use crate::error::StartupError;
use crate::irq::{scan_irqs, IrqRegistry};
use crate::kernelfs::KernelFs;
use crate::proximity::PxmTable;
use crate::stats::{gather_statistics, link_irqs_to_cpus, show_statistics};
use crate::topology::{scan_cpus, scan_numas, Cpu, Numa};
use crate::uevent::Sleeper;

/// Everything the daemon needs, resolved from the command line.
#[derive(Debug, Clone)]
pub struct Settings {
    pub threshold: f64,
    pub strategy: Strategy,
    pub ht: bool,
    pub short_interval: Duration,
    pub long_interval: Duration,
    pub pxm: Option<PathBuf>,
    pub non_local: bool,
    pub verbose: bool,
}

/// The whole balancer state: topology, proximity table, IRQ registry and
/// the per-iteration candidate list. All mutation happens on one thread,
/// inside [`Balancer::run_iteration`].
#[derive(Debug)]
pub struct Balancer {
    settings: Settings,
    fs: KernelFs,
    cpus: Vec<Cpu>,
    numas: Vec<Numa>,
    pxms: PxmTable,
    irqs: IrqRegistry,
    balance_irqs: Vec<u32>,
    rng: StdRng,
}

impl Balancer {
    pub fn new(settings: Settings, fs: KernelFs) -> Result<Self, StartupError> {
        let numas = scan_numas(&fs);
        let cpus = scan_cpus(&fs, settings.ht);
        if cpus.is_empty() {
            return Err(StartupError::NoCpus(fs.cpu_dir(0)));
        }

        let pxms = match &settings.pxm {
            Some(path) => {
                PxmTable::load(path, &numas).map_err(|source| StartupError::PxmConfig {
                    path: path.clone(),
                    source,
                })?
            }
            None => PxmTable::empty(),
        };

        Ok(Balancer {
            settings,
            fs,
            cpus,
            numas,
            pxms,
            irqs: IrqRegistry::new(),
            balance_irqs: Vec::new(),
            rng: StdRng::from_rng(&mut rand::rng()),
        })
    }

    /// Logs the discovered topology and proximity table once at startup.
    pub fn show_inventory(&self) {
        for numa in &self.numas {
            debug!("NUMA node {} cpumap {}", numa.id, numa.cpumap);
        }
        for cpu in &self.cpus {
            debug!(
                "CPU {} package {} core {} mask {}",
                cpu.id, cpu.package_id, cpu.core_id, cpu.cpumask
            );
        }
        for pxm in self.pxms.iter() {
            debug!("PXM: {} cpumask {}", pxm.addr, pxm.cpumask.pretty());
        }
    }

    fn show_irqs(&self) {
        for irq in self.irqs.values() {
            debug!(
                "IRQ {:3} {} [{}] {}",
                irq.irq,
                irq.local_cpus.pretty(),
                irq.kind,
                irq.desc
            );
        }
    }

    /// Re-enumerates CPUs and NUMA nodes. Triggered by SIGUSR1 after a
    /// hotplug event; takes effect at the iteration boundary.
    pub fn rescan_topology(&mut self) {
        info!("Rescanning topology");
        let cpus = scan_cpus(&self.fs, self.settings.ht);
        if cpus.is_empty() {
            warn!("topology rescan found no CPUs, keeping the old list");
            return;
        }
        self.numas = scan_numas(&self.fs);
        self.cpus = cpus;
    }

    /// One full pass: discover, relink, sample, choose, balance, apply.
    ///
    /// Returns true when the overload scan selected a migration, i.e.
    /// rebalancing is in progress and the short sleep applies. Newly
    /// discovered IRQs are placed either way; placement of a new device's
    /// IRQ doesn't mean the system is busy.
    pub fn run_iteration(&mut self) -> bool {
        debug!("---- iteration ----");

        scan_irqs(&self.fs, &mut self.irqs, &mut self.balance_irqs, &self.pxms);
        if self.settings.verbose {
            self.show_irqs();
        }

        link_irqs_to_cpus(&mut self.cpus, &mut self.irqs);
        gather_statistics(&self.fs, &mut self.cpus, &mut self.irqs);
        show_statistics(&self.cpus, &self.irqs, self.settings.verbose);

        let seeded = self.balance_irqs.len();
        choose_irqs_to_move(
            &mut self.cpus,
            &mut self.irqs,
            &mut self.balance_irqs,
            self.settings.threshold,
            self.settings.strategy,
            &mut self.rng,
        );
        let migrating = self.balance_irqs.len() > seeded;

        if !self.balance_irqs.is_empty() {
            balance(
                &mut self.cpus,
                &mut self.irqs,
                &self.balance_irqs,
                self.settings.threshold,
                self.settings.non_local,
            );
            apply_affinity(&self.fs, &mut self.cpus, &mut self.irqs, &self.balance_irqs);
            self.balance_irqs.clear();
        }

        migrating
    }

    #[cfg(test)]
    fn irq(&self, num: u32) -> &crate::irq::Irq {
        &self.irqs[&num]
    }
}

/// Runs the daemon until a termination signal arrives.
pub fn run(settings: Settings) -> Result<(), StartupError> {
    let term = Arc::new(AtomicBool::new(false));
    let rescan = Arc::new(AtomicBool::new(false));
    for signal in [SIGTERM, SIGINT, SIGQUIT] {
        signal_hook::flag::register(signal, term.clone())
            .expect("cannot register signal handler");
    }
    signal_hook::flag::register(SIGUSR1, rescan.clone())
        .expect("cannot register signal handler");

    let mut balancer = Balancer::new(settings.clone(), KernelFs::host())?;
    balancer.show_inventory();
    let sleeper = Sleeper::new();
    info!("Start balancing");

    while !term.load(Ordering::Relaxed) {
        if rescan.swap(false, Ordering::Relaxed) {
            balancer.rescan_topology();
        }

        let migrating = balancer.run_iteration();
        let interval = if migrating {
            settings.short_interval
        } else {
            settings.long_interval
        };

        if term.load(Ordering::Relaxed) {
            break;
        }
        sleeper.sleep(interval);
    }

    info!("Stop balancing");
    Ok(())
}
