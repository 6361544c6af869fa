use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::balance::Strategy;
use crate::daemon::Settings;
use crate::error::StartupError;

#[derive(Debug, Parser)]
#[command(
    name = "irqd",
    version,
    about = r#"
irqd keeps hardware interrupts spread across CPUs.

Every few seconds it samples per-CPU IRQ load and per-IRQ interrupt
counts from /proc, and when a CPU spends more than the threshold share
of its time in interrupt context, one IRQ is migrated to the least
loaded CPU that is local to the interrupting device.

EXAMPLES:
    # Run with defaults (log to stderr; RUST_LOG=debug for detail):
    irqd

    # Consider a CPU overloaded at 50% IRQ load, evict the heaviest IRQ:
    irqd --threshold 50 --strategy max

    # Pin devices to CPUs by PCI address prefix:
    irqd --pxm /etc/irqd-proximity.conf
"#
)]
pub struct Opt {
    /// IRQ load (in percent) at which a CPU counts as overloaded.
    #[arg(short, long, default_value_t = 99.0)]
    pub threshold: f64,

    /// How to choose the IRQ to move off an overloaded CPU.
    #[arg(short, long, value_enum, default_value_t = Strategy::Rnd)]
    pub strategy: Strategy,

    /// Also route IRQs to hyper-threaded sibling CPUs. Not recommended.
    #[arg(long)]
    pub ht: bool,

    /// Iteration interval while rebalancing is in progress.
    #[arg(short = 'i', long, default_value = "2s", value_parser = humantime::parse_duration)]
    pub short_interval: Duration,

    /// Iteration interval when the system is balanced.
    #[arg(short = 'I', long, default_value = "5s", value_parser = humantime::parse_duration)]
    pub long_interval: Duration,

    /// Proximity config file mapping device-address prefixes to cpumasks.
    #[arg(short = 'x', long, value_name = "PATH")]
    pub pxm: Option<PathBuf>,

    /// Allow moving an IRQ to a non-local CPU when every local CPU is
    /// overloaded. Cross-socket interrupt traffic is rarely a win.
    #[arg(long)]
    pub non_local: bool,

    /// Log the discovered topology and per-IRQ statistics.
    #[arg(short, long)]
    pub verbose: bool,
}

impl Opt {
    pub fn settings(&self) -> Result<Settings, StartupError> {
        if !(self.threshold > 0.0 && self.threshold <= 100.0) {
            return Err(StartupError::Threshold(self.threshold));
        }
        Ok(Settings {
            threshold: self.threshold,
            strategy: self.strategy,
            ht: self.ht,
            short_interval: self.short_interval,
            long_interval: self.long_interval,
            pxm: self.pxm.clone(),
            non_local: self.non_local,
            verbose: self.verbose,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Opt::command().debug_assert();
    }

    #[test]
    fn defaults_match_the_daemon_defaults() {
        let opt = Opt::parse_from(["irqd"]);
        let settings = opt.settings().unwrap();
        assert_eq!(settings.threshold, 99.0);
        assert_eq!(settings.strategy, Strategy::Rnd);
        assert!(!settings.ht);
        assert_eq!(settings.short_interval, Duration::from_secs(2));
        assert_eq!(settings.long_interval, Duration::from_secs(5));
        assert!(!settings.non_local);
    }

    #[test]
    fn strategy_and_intervals_parse() {
        let opt = Opt::parse_from([
            "irqd",
            "--strategy",
            "max",
            "--short-interval",
            "500ms",
            "--long-interval",
            "1m",
        ]);
        let settings = opt.settings().unwrap();
        assert_eq!(settings.strategy, Strategy::Max);
        assert_eq!(settings.short_interval, Duration::from_millis(500));
        assert_eq!(settings.long_interval, Duration::from_secs(60));

        assert!(Opt::try_parse_from(["irqd", "--strategy", "round-robin"]).is_err());
    }

    #[test]
    fn out_of_range_threshold_is_fatal() {
        for bad in ["--threshold=0", "--threshold=-3", "--threshold=100.5"] {
            let opt = Opt::parse_from(["irqd", bad]);
            assert!(matches!(
                opt.settings(),
                Err(StartupError::Threshold(_))
            ));
        }
        let opt = Opt::parse_from(["irqd", "--threshold", "100"]);
        assert!(opt.settings().is_ok());
    }
}
