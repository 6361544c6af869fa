mod balance;
mod cli;
mod cpumask;
mod daemon;
mod error;
mod irq;
mod kernelfs;
mod proximity;
mod stats;
mod topology;
mod uevent;

use clap::Parser;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opt = cli::Opt::parse();
    let settings = match opt.settings() {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = daemon::run(settings) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
