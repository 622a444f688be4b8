use anyhow::{Context, Result};
use clap::Parser;
use mpp_decode::{
    Codec, DecodeSession, DecoderConfig, OutputFormat, ReceiveOutcome, SendOutcome, SimConfig,
    SimUnit, SimulatedEngine, Timestamp,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Decode a synthetic stream on the simulated MPP engine")]
struct Args {
    #[arg(long, default_value = "h264")]
    codec: String,
    #[arg(long, default_value = "drm")]
    output: String,
    #[arg(long, default_value_t = 240)]
    frames: usize,
    #[arg(long, default_value_t = 1280)]
    width: u16,
    #[arg(long, default_value_t = 720)]
    height: u16,
    /// Switch to 1920x1080 after this many frames.
    #[arg(long)]
    resize_at: Option<usize>,
    #[arg(long, default_value_t = 0)]
    latency_polls: u32,
    #[arg(long)]
    report_fps: Option<bool>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let codec = parse_codec(&args.codec)?;
    let output = parse_output(&args.output)?;

    let (engine, probe) = SimulatedEngine::new(SimConfig {
        width: u32::from(args.width),
        height: u32::from(args.height),
        decode_latency_polls: args.latency_polls,
        ..SimConfig::default()
    });
    let mut config = DecoderConfig::new(codec, output).with_extradata(SimUnit::Header.encode());
    if let Some(enabled) = args.report_fps {
        config = config.with_report_fps(enabled);
    }
    let mut session =
        DecodeSession::open(Box::new(engine), config).context("failed to open decoder")?;

    let mut held = Vec::new();
    let mut decoded = 0usize;
    for index in 0..args.frames {
        let unit = match args.resize_at {
            Some(at) if at == index => SimUnit::InfoChange {
                width: 1920,
                height: 1080,
            },
            _ => SimUnit::Frame,
        };
        let data = unit.encode();
        while session
            .send(&data, Some(Timestamp(index as i64)))
            .context("send failed")?
            == SendOutcome::TryAgain
        {
            if let ReceiveOutcome::Frame(frame) = session.receive().context("receive failed")? {
                decoded += 1;
                held.push(frame);
                held.truncate(4);
            }
        }
    }

    session.send(&[], None).context("end of stream failed")?;
    loop {
        match session.receive().context("receive failed")? {
            ReceiveOutcome::Frame(_) => decoded += 1,
            ReceiveOutcome::TryAgain => {}
            ReceiveOutcome::EndOfStream => break,
        }
    }

    let summary = session.summary();
    let stats = session.retrieve_stats();
    let admission = session.admission_stats();
    session.close();

    println!(
        "decoded_frames={decoded}, width={:?}, height={:?}, pixel_format={:?}, info_changes={}, peak_in_flight={}, held_after_close={}, engine_destroyed={}",
        summary.width,
        summary.height,
        summary.pixel_format,
        stats.info_changes,
        admission.peak_in_flight,
        held.len(),
        probe.destroyed()
    );
    drop(held);
    println!("engine_destroyed={}", probe.destroyed());

    Ok(())
}

fn parse_codec(raw: &str) -> Result<Codec> {
    match raw.to_ascii_lowercase().as_str() {
        "h264" => Ok(Codec::H264),
        "hevc" | "h265" => Ok(Codec::Hevc),
        "vp8" => Ok(Codec::Vp8),
        "vp9" => Ok(Codec::Vp9),
        other => anyhow::bail!("unsupported codec: {other}"),
    }
}

fn parse_output(raw: &str) -> Result<OutputFormat> {
    match raw.to_ascii_lowercase().as_str() {
        "drm" | "drm_prime" => Ok(OutputFormat::DrmPrime),
        "yuv420p" | "sw" => Ok(OutputFormat::Yuv420p),
        other => anyhow::bail!("unsupported output: {other}"),
    }
}
