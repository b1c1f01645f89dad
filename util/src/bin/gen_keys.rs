use clap::{App, Arg};
use sett::encoding::base64;
use sett::keys::Identity;
use std::path::Path;
use std::process;

fn main() {
    let matches = App::new("Key Generator")
        .version("1.0")
        .author("Warren Labs")
        .about("Generates an Ed25519 node identity as base64 key files.")
        .arg(
            Arg::with_name("OUT_DIR")
                .help("Directory the key files are written into")
                .required(true),
        )
        .arg(
            Arg::with_name("NAME")
                .help("Base name of the key files (default: node)")
                .required(false),
        )
        .get_matches();

    let out_dir = matches.value_of("OUT_DIR").unwrap();
    let name = matches.value_of("NAME").unwrap_or("node");

    let identity = match Identity::generate() {
        Ok(identity) => identity,
        Err(err) => {
            eprintln!("gen_keys: {}", err);
            process::exit(1);
        }
    };

    if let Err(err) = identity.save(Path::new(out_dir), name) {
        eprintln!("gen_keys: {}", err);
        process::exit(1);
    }

    println!("wrote {}/{}.pub and {}/{}.sec", out_dir, name, out_dir, name);
    println!("public key: {}", base64::encode(identity.public()));
}
