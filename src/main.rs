use anyhow::{Context as AnyhowContext, Result};
use clap::Parser;
use serde::Serialize;

use indicatif::ProgressStyle;
use tracing::{info, info_span};
use tracing_indicatif::span_ext::IndicatifSpanExt;
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{filter::LevelFilter, prelude::*};

use tld_rust::bbox::BoundingBox;
use tld_rust::config::*;
use tld_rust::synthetic::SyntheticScene;
use tld_rust::tld::{FrameResult, Tld};

#[derive(Parser)]
pub struct Args {
    /// Number of frames in the synthetic sequence
    #[clap(long, default_value = "100")]
    pub frames: usize,
    /// JSON file with tracker parameters, replaces the command line values
    #[clap(long)]
    pub config_file: Option<String>,
    /// Print one JSON line per frame
    #[clap(long)]
    pub json: bool,
    #[clap(long, default_value = "320")]
    pub width: usize,
    #[clap(long, default_value = "240")]
    pub height: usize,
    #[clap(long, default_value = "48")]
    pub object_size: usize,
    /// Object displacement per frame in pixels
    #[clap(long, default_value = "2")]
    pub speed_x: i32,
    #[clap(long, default_value = "1")]
    pub speed_y: i32,
    #[clap(flatten)]
    pub config: Config,
}

#[derive(Serialize)]
struct FrameRecord<'a> {
    frame: usize,
    truth: BoundingBox,
    #[serde(flatten)]
    result: &'a FrameResult,
}

fn load_config(path: &str) -> Result<Config> {
    let text = std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path))?;
    let config = serde_json::from_str(&text).with_context(|| format!("cannot parse {}", path))?;
    Ok(config)
}

fn main() -> Result<()> {
    // parse the config
    let args = Args::parse();
    let config = match &args.config_file {
        Some(path) => load_config(path)?,
        None => args.config.clone(),
    };

    // setup logging
    let level = if args.json {
        LevelFilter::WARN
    } else {
        LevelFilter::INFO
    };
    let indicatif_layer = IndicatifLayer::new();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(indicatif_layer.get_stdout_writer())
                .with_filter(level),
        )
        .with(indicatif_layer)
        .init();
    info!("config:\n{}", config);

    let scene = SyntheticScene::new(args.width, args.height, args.object_size, config.seed)?
        .with_motion((0, 0), (args.speed_x, args.speed_y));
    let mut tld = Tld::new(&scene.frame(0), &scene.bbox(0), config)?;

    let header_span = info_span!("header");
    header_span.pb_set_style(&ProgressStyle::default_bar());
    header_span.pb_set_length(args.frames.saturating_sub(1) as u64);
    let header_span_enter = header_span.enter();

    let mut on_target = 0;
    let mut valid = 0;
    for index in 1..args.frames {
        let truth = scene.bbox(index);
        let result = tld.run(&scene.frame(index))?;
        if result.fused.map_or(false, |fused| fused.iou(&truth) > 0.5) {
            on_target += 1;
        }
        if result.valid {
            valid += 1;
        }
        if args.json {
            let record = FrameRecord {
                frame: index,
                truth,
                result: &result,
            };
            println!("{}", serde_json::to_string(&record)?);
        }
        header_span.pb_inc(1);
    }

    std::mem::drop(header_span_enter);
    std::mem::drop(header_span);

    info!(
        "{} of {} frames on target, {} valid",
        on_target,
        args.frames.saturating_sub(1),
        valid
    );
    Ok(())
}
