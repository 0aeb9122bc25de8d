use anyhow::{Context, Result, ensure};
use clap::Parser;
use log::info;
use rustverb::buffer::AudioBuffer;
use rustverb::engine::{Convolution, DEFAULT_SPIN_LIMIT, KernelSpectra, Response};
use rustverb::ir::loader::load_wav;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "render")]
#[command(about = "Offline convolution of a WAV file with an impulse response.")]
struct Args {
    #[arg(help = "Input WAV file")]
    input: PathBuf,
    #[arg(help = "Impulse response WAV file")]
    ir: PathBuf,
    #[arg(long, help = "Output WAV file (default: render_<timestamp>.wav)")]
    output: Option<PathBuf>,
    #[arg(long, default_value_t = 64)]
    min_part: usize,
    #[arg(long, default_value_t = 8192)]
    max_part: usize,
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();

    let args = Args::parse();

    let input = load_wav(&args.input)
        .with_context(|| format!("failed to load input {:?}", args.input))?;
    let ir = load_wav(&args.ir).with_context(|| format!("failed to load IR {:?}", args.ir))?;

    let sample_rate = wav_sample_rate(&args.input)?;
    ensure!(
        sample_rate == wav_sample_rate(&args.ir)?,
        "input and IR sample rates differ"
    );

    let channels = ir.channels;
    info!(
        "rendering {} frames x {} channels through a {} frame response",
        input.frames, channels, ir.frames
    );

    let response = Response::new(channels, ir.frames, args.min_part, args.max_part)?;
    let mut engine = Convolution::new(response, 0, false, DEFAULT_SPIN_LIMIT)?;

    let kernel = KernelSpectra::compute(engine.response(), &ir, 0, 0)?;
    let mut retired = Vec::new();
    engine.set_kernel(&kernel, None, &mut retired);

    let bin = engine.bin_size();
    let latency = engine.latency();
    let total = input.frames + ir.frames;

    let output_path = args.output.unwrap_or_else(|| {
        PathBuf::from(format!(
            "render_{}.wav",
            chrono::Local::now().format("%Y%m%d_%H%M%S")
        ))
    });

    let spec = hound::WavSpec {
        channels: channels as u16,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(&output_path, spec)
        .with_context(|| format!("failed to create {output_path:?}"))?;

    let mut src = AudioBuffer::new(channels, bin);
    let mut dst = AudioBuffer::new(channels, bin);
    let mut written = 0usize;
    let mut offset = 0usize;

    while written < total {
        src.clear();
        for ch in 0..channels {
            // Mono inputs fan out to every response channel.
            let src_ch = if input.channels == 1 { 0 } else { ch };
            if src_ch < input.channels {
                let block = src.channel_mut(ch);
                for (i, s) in block.iter_mut().enumerate() {
                    let frame = offset + i;
                    if frame < input.frames {
                        *s = input.sample(src_ch, frame);
                    }
                }
            }
        }

        engine.process(&mut dst, &src, bin);
        offset += bin;

        // Skip the engine's latency, then write until the tail is done.
        for i in 0..bin {
            if offset - bin + i < latency {
                continue;
            }
            if written >= total {
                break;
            }
            for ch in 0..channels {
                writer.write_sample(dst.channel(ch)[i])?;
            }
            written += 1;
        }
    }

    writer.finalize().context("failed to finalise output")?;
    info!("wrote {} frames to {:?}", written, output_path);

    Ok(())
}

fn wav_sample_rate(path: &Path) -> Result<u32> {
    let reader = hound::WavReader::open(path)
        .with_context(|| format!("failed to open {path:?}"))?;
    Ok(reader.spec().sample_rate)
}
