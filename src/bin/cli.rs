use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use rustverb::host::EngineParams;
use rustverb::host::jack::AudioSession;
use rustverb::ir::loader::IrLoader;
use rustverb::settings::Settings;
use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

// Catch stray allocations in the audio callback during debug runs.
#[cfg(debug_assertions)]
#[global_allocator]
static ALLOC: assert_no_alloc::AllocDisabler = assert_no_alloc::AllocDisabler;

#[derive(Parser, Debug)]
#[command(name = "rustverb")]
#[command(about = "Real-time partitioned convolution over JACK.")]
struct Args {
    #[arg(long, help = "Impulse response to load (name inside the IR directory)")]
    ir: Option<String>,
    #[arg(
        long,
        env = "RUSTVERB_IR_DIR",
        help = "Directory scanned for impulse responses (default from settings)"
    )]
    ir_dir: Option<String>,
    #[arg(long, help = "Minimum partition size in frames")]
    min_part: Option<usize>,
    #[arg(long, help = "Maximum partition size in frames")]
    max_part: Option<usize>,
    #[arg(long, help = "Number of modules kept on the audio thread (0 = all)")]
    rt_procs: Option<usize>,
    #[arg(long, help = "List available impulse responses and exit")]
    list: bool,
}

const KERNEL_BUFFER_ID: u32 = 0;

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();

    let args = Args::parse();
    let settings = Settings::load().context("failed to load settings")?;

    info!("rustverb v{}", env!("CARGO_PKG_VERSION"));

    let ir_dir = args.ir_dir.unwrap_or_else(|| settings.ir_dir.clone());

    let params = EngineParams {
        min_part_size: args.min_part.unwrap_or(settings.engine.min_part_size),
        max_part_size: args.max_part.unwrap_or(settings.engine.max_part_size),
        num_rt_procs: args.rt_procs.unwrap_or(settings.engine.num_rt_procs),
        ..settings.engine.clone()
    };

    let (session, mut controller) =
        AudioSession::start("rustverb", params, &settings.audio).context("failed to go live")?;

    let loader = IrLoader::new(Path::new(&ir_dir), session.sample_rate() as u32)
        .context("failed to scan IR directory")?;

    if args.list {
        for name in loader.available_ir_names() {
            println!("{name}");
        }
        return Ok(());
    }

    let ir = match &args.ir {
        Some(name) => loader
            .load_by_name(name)
            .with_context(|| format!("failed to load IR '{name}'"))?,
        None => loader.get_first().context("no impulse response found")?,
    };

    controller.init(true).context("failed to build engine")?;
    controller.buffers_mut().insert(KERNEL_BUFFER_ID, ir);
    controller.set_kernel(KERNEL_BUFFER_ID, 0, 0)?;

    let running = Arc::new(AtomicBool::new(true));
    let shutdown_flag = Arc::clone(&running);

    ctrlc::set_handler(move || {
        info!("Ctrl+C received, shutting down...");
        shutdown_flag.store(false, Ordering::SeqCst);
    })
    .expect("error setting Ctrl+C handler");

    let mut starved_seen = 0;
    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_secs(1));
        controller.drain_retired();

        let starved = controller.starved_blocks();
        if starved > starved_seen {
            warn!("{} blocks starved of worker output so far", starved);
            starved_seen = starved;
        }
    }

    controller.release()?;
    // Give the callback a moment to let go of the engine, then free it.
    thread::sleep(Duration::from_millis(100));
    controller.drain_retired();
    session.deactivate()?;

    Ok(())
}
