use clap::{App, Arg};
use sett::keys::Identity;
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use warren::conf::Conf;
use warren::core::Core;
use warren::error::CoreError;
use warren::tun::{MemTun, TunDevice};

fn main() {
    let matches = App::new("warrend")
        .version("0.1.0")
        .author("Warren Labs")
        .about("Peer-to-peer overlay network daemon.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the TOML configuration file")
                .required(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Raise all log thresholds to debug"),
        )
        .arg(
            Arg::with_name("trace")
                .short("t")
                .long("trace")
                .help("Raise all log thresholds to trace"),
        )
        .get_matches();

    let config_path = matches.value_of("CONFIG_FILE").unwrap();

    if let Err(err) = run(config_path, matches.is_present("verbose"), matches.is_present("trace")) {
        eprintln!("warrend: {}", err);
        process::exit(1);
    }
}

fn run(config_path: &str, verbose: bool, trace: bool) -> Result<(), CoreError> {
    let mut conf = Conf::load(config_path)?;

    if verbose {
        conf.apply_verbose();
    }

    if trace {
        conf.apply_trace();
    }

    let identity = Identity::load(Path::new(&conf.conf_dir), "node")?;

    let tun: Arc<dyn TunDevice + Send + Sync> = match conf.if_drv.as_str() {
        "mem" => Arc::new(MemTun::new()),
        other => {
            return Err(CoreError::Config(format!(
                "tun driver '{}' is not built into this binary",
                other
            )));
        }
    };

    let mut core = Core::create(conf, identity, tun)?;
    core.start()?;

    // The primary worker carries the process; park until the keep-alive stamp
    // stops advancing (i.e. the engine was torn down externally).
    loop {
        std::thread::sleep(Duration::from_secs(60));

        let stamp = core
            .ctl()
            .status
            .keep_alive_ts_sec
            .load(std::sync::atomic::Ordering::Relaxed);

        if stamp + 120 < sett::time::timestamp_secs() {
            break;
        }
    }

    core.stop();
    Ok(())
}
