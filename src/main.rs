use anyhow::{ensure, Context, Result};
use log::info;

use deeplabv3plus_seg::{Config, LegendFont, OrtLoader, ProgressTracker, SegmentationPipeline};

fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    let config = Config::new();

    ensure!(config.input.exists(), "Input path does not exist");
    ensure!(
        (0.0..=1.0).contains(&config.overlay_alpha),
        "Overlay alpha must be within [0, 1]"
    );

    let font = if config.no_legend {
        None
    } else {
        LegendFont::locate(config.font.as_deref()).context("Failed to load legend font")?
    };

    let mut pipeline = SegmentationPipeline::new(
        OrtLoader::new(config.device_id),
        config.pipeline_settings(),
    )
    .with_font(font)
    .with_params(config.params().context("Failed to read parameters")?);

    let task = pipeline.info();
    info!("{} {} ({})", task.name, task.version, task.article);

    let tracker = ProgressTracker::new(&config.input, pipeline.progress_steps())?;
    let summary = tracker
        .process_images(&mut pipeline, &config.output_dir, config.output_format())
        .context("Segmentation aborted")?;

    info!(
        "Processed {} image(s), {} failed, output in {}",
        summary.processed,
        summary.failed,
        config.output_dir.display()
    );
    ensure!(summary.failed == 0, "{} image(s) failed", summary.failed);
    Ok(())
}
