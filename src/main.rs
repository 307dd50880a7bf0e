mod config;
mod dsp;
mod ext;
mod net;
mod util;
mod wf;

use anyhow::{Context, Result};
use config::ServerConfig;
use dsp::transform::TransformPool;
use dsp::{ProcessorUpdate, SampleBlock, SampleProcessor, SampleStage, Samples};
use ext::{ExtEvent, ExtPayload, ExtRegistry, SampleCategory};
use net::PacketSink;
use rustfft::num_complex::Complex32;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use util::telemetry;
use wf::channel::WaterfallChannel;
use wf::shmem::SharedStateRegion;
use wf::{ChannelId, DisplayParams, WF_C_NFFT, WF_C_NSAMPS};

use tracing::{error, info};

fn main() {
    telemetry::init();
    info!("cascade starting up");
    if let Err(err) = run() {
        error!("cascade failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let config_path = std::env::var_os("CASCADE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("cascade.json"));
    let config = ServerConfig::load(&config_path)?;
    info!(
        "{} rx channels, {} transform contexts, storage {:?}",
        config.rx_channels, config.wf_channels, config.storage
    );

    let window = config.window.coefficients(WF_C_NSAMPS);
    let region = Arc::new(SharedStateRegion::new(
        config.storage,
        config.rx_channels,
        config.wf_channels,
        &window,
    ));
    let pool = Arc::new(TransformPool::new(config.wf_channels, WF_C_NFFT));
    let registry = Arc::new(ExtRegistry::new());
    let (sink, packet_rx) = net::packet_stream(config.egress_capacity);

    let params = DisplayParams {
        compression: config.compression,
        mindb: config.mindb,
        maxdb: config.maxdb,
        ..DisplayParams::default()
    };
    let mut channel = WaterfallChannel::new(
        ChannelId::new(0),
        Arc::clone(&pool),
        Arc::clone(&region),
        params,
        WF_C_NFFT,
        config.overlap_tolerance,
    );
    channel
        .activate(config.sample_rate_hz)
        .context("activating waterfall channel 0")?;

    // Example extension subscriber, standing in for the registered
    // auxiliary modules a real deployment would load.
    let iq_blocks = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&iq_blocks);
    registry.register(
        channel.id(),
        SampleCategory::PreFilterIq,
        Arc::new(move |_event| {
            counter.fetch_add(1, Ordering::Relaxed);
        }),
    );

    // Synthetic sample source: a handful of frames of a single tone. A real
    // deployment receives these blocks from the receiver front end via the
    // external scheduler.
    let tone: Vec<Complex32> = (0..WF_C_NSAMPS)
        .map(|i| {
            let phase = core::f32::consts::TAU * 100.0 * i as f32 / WF_C_NFFT as f32;
            Complex32::new(phase.cos(), phase.sin())
        })
        .collect();

    let mut emitted = 0usize;
    for _ in 0..8 {
        let block = SampleBlock {
            channel: channel.id(),
            stage: SampleStage::PreFilter,
            samples: Samples::Complex(&tone),
            sample_rate: config.sample_rate_hz,
            timestamp: Instant::now(),
        };
        registry.dispatch(&ExtEvent {
            channel: block.channel,
            category: SampleCategory::PreFilterIq,
            payload: ExtPayload::Iq(&tone),
        });
        if let ProcessorUpdate::Snapshot(packets) = channel.process_block(&block) {
            for packet in packets {
                emitted += 1;
                if !sink.send(packet) {
                    error!("transport closed, stopping channel");
                    channel.request_stop();
                    break;
                }
            }
        }
    }

    while let Ok(packet) = packet_rx.try_recv() {
        info!(
            "packet seq {} ({} bytes{})",
            packet.seq,
            packet.bytes.len(),
            if packet.compressed { ", compressed" } else { "" }
        );
    }

    channel.stop();
    info!(
        "done: {emitted} packets emitted, {} IQ blocks fanned out, {} rows coalesced, overlapped={}",
        iq_blocks.load(Ordering::Relaxed),
        channel.flow().dropped_rows(),
        channel.flow().overlapped_sampling()
    );
    Ok(())
}
