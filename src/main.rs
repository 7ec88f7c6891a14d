use std::fs::File;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use amifuse::boot::{BootConfig, boot};
use amifuse::bridge::Bridge;
use amifuse::cache::InodeCache;
use amifuse::cpu::Interp;
use amifuse::error::AmiError;
use amifuse::fs::AmigaFs;
use amifuse::rdb;

/// Exit codes: 0 clean unmount, 1 argument error, 2 bootstrap failed,
/// 3 FUSE mount failed, 4 image unreadable.
const EXIT_BOOTSTRAP: i32 = 2;
const EXIT_FUSE: i32 = 3;
const EXIT_IMAGE: i32 = 4;

#[derive(Parser)]
#[command(
    name = "amifuse",
    version,
    about = "Mount an Amiga disk image by running its original filesystem handler in emulation"
)]
struct Args {
    /// Amiga filesystem handler binary (hunk executable, e.g. pfs3aio)
    #[arg(long)]
    driver: PathBuf,

    /// Hard disk image to mount
    #[arg(long)]
    image: PathBuf,

    /// Where to mount the volume
    #[arg(long)]
    mountpoint: PathBuf,

    /// Block size when the image has no RDB (default 512)
    #[arg(long)]
    block_size: Option<u32>,

    /// Let --block-size override the RDB instead of the other way around
    #[arg(long)]
    prefer_cli_block_size: bool,

    /// Volume name shown by the host (default: RDB drive name)
    #[arg(long)]
    volname: Option<String>,

    /// AmigaDOS device name passed to the handler
    #[arg(long, default_value = "DH0")]
    device: String,

    /// Verbose diagnostics
    #[arg(long)]
    debug: bool,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            exit(1);
        }
    };
    let filter = if args.debug { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    match run(args) {
        Ok(()) => {}
        Err((code, msg)) => {
            error!("{msg}");
            eprintln!("amifuse: {msg}");
            exit(code);
        }
    }
}

fn run(args: Args) -> Result<(), (i32, String)> {
    let driver = std::fs::read(&args.driver)
        .map_err(|e| (EXIT_BOOTSTRAP, format!("cannot read driver {:?}: {e}", args.driver)))?;

    let image = File::open(&args.image)
        .map_err(|e| (EXIT_IMAGE, format!("cannot open image {:?}: {e}", args.image)))?;
    let image_len = image
        .metadata()
        .map_err(|e| (EXIT_IMAGE, format!("cannot stat image: {e}")))?
        .len();
    if image_len == 0 {
        return Err((EXIT_IMAGE, "image is empty".into()));
    }

    let env = rdb::probe(&image, image_len, args.block_size, args.prefer_cli_block_size)
        .map_err(|e| (EXIT_IMAGE, format!("image probe failed: {e}")))?;
    info!(
        "image: {} blocks of {} bytes{}",
        env.total_blocks(image_len),
        env.block_size,
        if env.from_rdb { " (from RDB)" } else { "" }
    );

    let mut cfg = BootConfig::new(driver, image, image_len, env.clone());
    cfg.device_name = args.device.clone();
    let vm = boot(cfg, Box::new(Interp)).map_err(|e| {
        let code = match e {
            AmiError::Image(_) | AmiError::Io(_) => EXIT_IMAGE,
            _ => EXIT_BOOTSTRAP,
        };
        (code, e.to_string())
    })?;

    let bridge = Arc::new(Bridge::new(vm));
    let cache = Arc::new(
        InodeCache::new(bridge.clone())
            .map_err(|e| (EXIT_BOOTSTRAP, format!("root examine failed: {e}")))?,
    );

    let volname = args
        .volname
        .or(env.drive_name)
        .unwrap_or_else(|| cache.volume_name());
    let volname = if volname.is_empty() {
        "AMIGA".to_string()
    } else {
        volname
    };
    info!("mounting volume {volname:?} at {:?}", args.mountpoint);

    let fs = AmigaFs::new(cache.clone(), bridge.block_size());
    let mut options = vec![
        fuser::MountOption::RO,
        fuser::MountOption::FSName("amifuse".into()),
        fuser::MountOption::Subtype("amifuse".into()),
    ];
    if cfg!(target_os = "macos") {
        options.push(fuser::MountOption::CUSTOM(format!("volname={volname}")));
    }

    fuser::mount2(fs, &args.mountpoint, &options)
        .map_err(|e| (EXIT_FUSE, format!("FUSE mount failed: {e}")))?;

    info!("clean unmount ({} packets)", bridge.packets_sent());
    Ok(())
}
