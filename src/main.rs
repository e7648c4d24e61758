// Copyright 2026 The extrootfs Developers. All Rights Reserved.
//
// SPDX-License-Identifier: (Apache-2.0 AND BSD-3-Clause)

use log::*;
use std::path::PathBuf;
use std::{env, process};

use clap::{Parser, Subcommand};

use extrootfs::node::{Config, NodeService};
use extrootfs::rootfs::{Output, Parameters};

fn parse_param(src: &str) -> std::result::Result<(String, String), String> {
    match src.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{src}'")),
    }
}

#[derive(Clone, Debug, Parser)]
#[command(
    name = "extrootfs",
    about = "Provision node-local root filesystems over NBD or iSCSI.",
    version,
    args_override_self = true
)]
struct Opt {
    /// Directory holding base images and per-volume state
    #[arg(long = "base-path", default_value = "/opt/extrootfs")]
    base_path: PathBuf,

    /// Directory receiving the `<VOLUME_ID>.json` output descriptors
    #[arg(long, default_value = "/opt/extrootfs/output")]
    output: PathBuf,

    /// File identifying this node; its hash is the persistent-reservation key
    #[arg(long = "hostname-file", default_value = "/etc/hostname")]
    hostname_file: PathBuf,

    /// Load the nbd kernel module if it is missing
    #[arg(long = "load-nbd")]
    load_nbd: bool,

    /// Log level (error, warn, info, debug, trace, off)
    #[arg(long = "log-level", default_value = "info")]
    log_level: LevelFilter,

    /// Log to syslog [default: stderr]
    #[arg(long)]
    syslog: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Clone, Debug, Subcommand)]
enum Cmd {
    /// Bind a volume to a block device, creating it on first use
    Publish {
        volume_id: String,

        /// Volume parameter, e.g. -p extrootfs.io/type=qemu (repeatable)
        #[arg(short = 'p', long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },
    /// Release the block device of a volume
    Unpublish { volume_id: String },
    /// Check that a published volume is still bound
    Probe { volume_id: String },
}

fn set_default_logger(log_level: LevelFilter) {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", log_level.to_string());
    }
    env_logger::init();
}

fn initialize_logging(opt: &Opt) {
    if opt.syslog {
        if let Err(e) = syslog::init(syslog::Facility::LOG_USER, opt.log_level, None) {
            set_default_logger(opt.log_level);
            warn!("can't enable syslog: {}", e);
        }
    } else {
        set_default_logger(opt.log_level);
    }
}

fn print_output(output: &Output) {
    match serde_json::to_string(output) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            error!("Failed to render output: {e}");
            process::exit(1);
        }
    }
}

fn main() {
    let opt = Opt::parse();
    initialize_logging(&opt);

    // NBD, iSCSI and sg_persist all need root.
    let uid = unsafe { libc::geteuid() };
    if uid != 0 {
        warn!("Running as uid {uid}, device operations will likely fail");
    }

    let config = Config {
        base_path: opt.base_path,
        output_base: opt.output,
        identity_file: opt.hostname_file,
        load_nbd_module: opt.load_nbd,
        ..Default::default()
    };
    let node = NodeService::new(&config);

    match opt.command {
        Cmd::Publish { volume_id, params } => {
            let params: Parameters = params.into_iter().collect();
            let output = node.publish(&volume_id, &params).unwrap_or_else(|e| {
                error!("{e}");
                process::exit(1);
            });
            print_output(&output);
        }
        Cmd::Unpublish { volume_id } => {
            if let Err(e) = node.unpublish(&volume_id) {
                error!("{e}");
                process::exit(1);
            }
        }
        Cmd::Probe { volume_id } => {
            let output = node.probe(&volume_id).unwrap_or_else(|e| {
                error!("{e}");
                process::exit(1);
            });
            print_output(&output);
        }
    }
}
