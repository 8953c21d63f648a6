//! AWS-backed roles and the `enroll` command.
//!
//! Each role validates the configuration it needs before touching any
//! backend, so a missing identifier exits the process before it serves.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::info;

use facegrid_autoscale::{Autoscaler, ScalingPolicy};
use facegrid_aws::{Ec2Fleet, S3BlobStore, SqsQueue, load_sdk_config};
use facegrid_core::{FacegridConfig, Role};
use facegrid_gateway::{CorrelationTable, GatewayState};
use facegrid_worker::{Gallery, GalleryRecognizer, ThumbnailEmbedder, Worker};

use crate::{serve_gateway, shutdown_on_ctrl_c};

/// Load the configured gallery and wrap it in a recognizer.
pub fn load_recognizer(config: &FacegridConfig) -> anyhow::Result<Arc<GalleryRecognizer>> {
    let path = config.gallery_path()?;
    let gallery = Gallery::load(path)
        .with_context(|| format!("failed to load gallery {}", path.display()))?;
    let embedder = ThumbnailEmbedder::new(config.worker.thumbnail_side);
    let recognizer = GalleryRecognizer::new(gallery, Box::new(embedder))
        .with_context(|| format!("gallery {} does not fit the embedder", path.display()))?;
    Ok(Arc::new(recognizer))
}

/// Run the HTTP gateway and its response drainer.
pub async fn run_gateway(config: FacegridConfig) -> anyhow::Result<()> {
    config.validate(Role::Gateway)?;
    info!("facegrid gateway starting");

    let sdk_config = load_sdk_config(&config.aws).await;
    let requests = Arc::new(SqsQueue::connect(&sdk_config, config.request_queue()?).await?);
    let responses = Arc::new(SqsQueue::connect(&sdk_config, config.response_queue()?).await?);
    let inputs = Arc::new(S3BlobStore::new(&sdk_config, config.input_bucket()?));
    info!(
        requests = %requests.url(),
        responses = %responses.url(),
        bucket = %inputs.bucket(),
        "backends connected"
    );

    let state = GatewayState {
        inputs,
        requests,
        results: Arc::new(CorrelationTable::new()),
        settings: Arc::new(config.gateway.clone()),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(shutdown_on_ctrl_c(shutdown_tx));

    serve_gateway(state, responses, config.gateway.listen, shutdown_rx).await
}

/// Run one worker loop.
pub async fn run_worker(config: FacegridConfig) -> anyhow::Result<()> {
    config.validate(Role::Worker)?;
    info!("facegrid worker starting");

    let recognizer = load_recognizer(&config)?;
    info!(entries = recognizer.gallery().entries.len(), "recognizer ready");

    let sdk_config = load_sdk_config(&config.aws).await;
    let requests = Arc::new(SqsQueue::connect(&sdk_config, config.request_queue()?).await?);
    let responses = Arc::new(SqsQueue::connect(&sdk_config, config.response_queue()?).await?);
    let inputs = Arc::new(S3BlobStore::new(&sdk_config, config.input_bucket()?));
    let outputs = Arc::new(S3BlobStore::new(&sdk_config, config.output_bucket()?));

    let worker = Worker::new(
        requests,
        responses,
        inputs,
        outputs,
        recognizer,
        &config.worker,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        worker.run(shutdown_rx).await;
    });

    shutdown_on_ctrl_c(shutdown_tx).await;
    let _ = handle.await;

    info!("worker stopped");
    Ok(())
}

/// Run the autoscaler against the EC2 worker pool.
pub async fn run_autoscaler(config: FacegridConfig) -> anyhow::Result<()> {
    config.validate(Role::Autoscaler)?;
    info!("facegrid autoscaler starting");

    let sdk_config = load_sdk_config(&config.aws).await;
    let queue = Arc::new(SqsQueue::connect(&sdk_config, config.request_queue()?).await?);
    let fleet = Arc::new(Ec2Fleet::new(
        &sdk_config,
        config.autoscaler.instance_name_pattern.clone(),
    ));
    info!(pattern = %config.autoscaler.instance_name_pattern, "instance pool configured");

    let mut autoscaler = Autoscaler::new(queue, fleet, ScalingPolicy::from(&config.autoscaler));
    let tick = config.autoscaler.tick;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        autoscaler.run(tick, shutdown_rx).await;
    });

    shutdown_on_ctrl_c(shutdown_tx).await;
    let _ = handle.await;

    info!("autoscaler stopped");
    Ok(())
}

/// Build a gallery from a directory of labelled images.
pub fn run_enroll(images: &Path, out: &Path, thumbnail_side: u32) -> anyhow::Result<()> {
    let embedder = ThumbnailEmbedder::new(thumbnail_side);
    let gallery = Gallery::enroll_dir(images, &embedder)
        .with_context(|| format!("failed to enroll images from {}", images.display()))?;
    gallery.save(out)?;

    info!(
        entries = gallery.entries.len(),
        dimension = gallery.dimension().unwrap_or_default(),
        out = %out.display(),
        "gallery written"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{DynamicImage, GrayImage, ImageFormat, Luma};

    use super::*;

    fn write_png(path: &Path, f: impl Fn(u32, u32) -> u8) {
        let img = GrayImage::from_fn(24, 24, |x, y| Luma([f(x, y)]));
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageLuma8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        std::fs::write(path, buf.into_inner()).unwrap();
    }

    #[test]
    fn enroll_then_load_recognizer() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("faces");
        std::fs::create_dir(&images).unwrap();
        write_png(&images.join("alice.png"), |x, _| (x * 8) as u8);
        write_png(&images.join("bob.png"), |_, y| (y * 8) as u8);
        let out = dir.path().join("gallery.json");

        run_enroll(&images, &out, 8).unwrap();

        let mut config = FacegridConfig::default();
        config.worker.gallery = Some(out);
        config.worker.thumbnail_side = 8;
        let recognizer = load_recognizer(&config).unwrap();
        assert_eq!(recognizer.gallery().entries.len(), 2);
    }

    #[test]
    fn recognizer_rejects_mismatched_thumbnail_side() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("faces");
        std::fs::create_dir(&images).unwrap();
        write_png(&images.join("alice.png"), |x, _| (x * 8) as u8);
        let out = dir.path().join("gallery.json");
        run_enroll(&images, &out, 8).unwrap();

        let mut config = FacegridConfig::default();
        config.worker.gallery = Some(out);
        config.worker.thumbnail_side = 16;
        assert!(load_recognizer(&config).is_err());
    }

    #[test]
    fn missing_gallery_setting_is_an_error() {
        let err = load_recognizer(&FacegridConfig::default()).unwrap_err();
        assert!(err.to_string().contains("worker.gallery"));
    }

    #[tokio::test]
    async fn roles_refuse_to_start_without_identifiers() {
        let config = FacegridConfig::default();
        assert!(run_gateway(config.clone()).await.is_err());
        assert!(run_worker(config.clone()).await.is_err());
        assert!(run_autoscaler(config).await.is_err());
    }
}
