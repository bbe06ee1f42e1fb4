//! Pipeline lifecycle: startup loading, the two workers, and shutdown.
//!
//! Two tasks run for the life of the process. The ingest worker polls the
//! frame source, applies the frame-skip policy and feeds a bounded queue.
//! The processing worker drains that queue and drives detection,
//! triangulation, tracking and risk assessment strictly in bundle order;
//! it is the only owner of the tracker and the risk engine. The TCP client
//! runs its own task (see `bds-tcp-client`). A single watch flag cancels
//! everything at its next suspension point.

use std::time::Duration;

use anyhow::Context;
use camino::Utf8PathBuf;
use hdrhistogram::Histogram;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use bds_config_data::BdsConfig;
use bds_core::{RiskConfig, RiskEngine, SessionTracker, TrackerConfig, Triangulator, TriangulatorConfig};
use bds_detect::{Detector, ReplayDetector};
use bds_frame_source::{latest_recording_dir, FrameSourceError, RecordingWatcher};
use bds_mvg::CameraSystem;
use bds_routes::{FixedRouteAssigner, RouteStore};
use bds_tcp_client::{EventSender, TcpClientConfig, TcpClientHandle};
use bds_types::{FrameBundle, RiskLevel};

/// Bundles waiting for the processing worker.
const PROCESSING_QUEUE_CAPACITY: usize = 10;
/// Processed-frame interval between timing summaries.
const STATS_INTERVAL: u64 = 150;
/// Processed-frame interval between maintenance passes.
const MAINTENANCE_INTERVAL: u64 = 50;
/// Rate limit for queue-full logging in the ingest worker.
const DROP_LOG_EVERY: u64 = 30;

pub async fn run(cfg: BdsConfig, model: Utf8PathBuf) -> anyhow::Result<()> {
    // ---- startup: anything failing here is fatal ----
    let recordings_root = Utf8PathBuf::from_path_buf(cfg.recordings_dir.clone())
        .map_err(|p| anyhow::anyhow!("recordings_dir is not utf-8: {}", p.display()))?;
    let recording = latest_recording_dir(&recordings_root)
        .with_context(|| format!("scanning {recordings_root}"))?
        .with_context(|| format!("no Recording_* directory under {recordings_root}"))?;
    let cameras = CameraSystem::from_recording_dir(&recording)
        .with_context(|| format!("loading camera calibrations from {recording}"))?;
    info!("{} cameras calibrated from {recording}", cameras.cams().len());

    let routes = RouteStore::load_dir(&cfg.routes_dir)
        .with_context(|| format!("loading routes from {}", cfg.routes_dir.display()))?;
    if routes.is_empty() {
        warn!(
            "no routes loaded from {}; risk will use direct distance only",
            cfg.routes_dir.display()
        );
    } else {
        info!("routes: {}", routes.route_names().collect::<Vec<_>>().join(", "));
    }

    let detector: Box<dyn Detector> =
        Box::new(ReplayDetector::from_path(&model, cfg.confidence_threshold)?);

    let triangulator = Triangulator::new(TriangulatorConfig {
        pixel_merge_distance: cfg.pixel_merge_distance,
        distance_threshold_m: cfg.distance_threshold,
    });
    let tracker = SessionTracker::new(TrackerConfig {
        position_jump_threshold: cfg.session.position_jump_threshold,
        jump_duration_threshold: cfg.session.jump_duration_threshold,
        min_session_length: cfg.session.min_session_length,
        clean_jump_threshold: cfg.session.clean_jump_threshold,
    });
    let risk_engine = RiskEngine::new(RiskConfig {
        downgrade_threshold: cfg.risk.downgrade_threshold,
        nominal_altitude_m: cfg.nominal_altitude_m,
    });
    let assigner = FixedRouteAssigner::new(cfg.assigned_route.clone());

    let tcp: Option<(EventSender, TcpClientHandle)> = if cfg.tcp.enabled {
        Some(bds_tcp_client::spawn(TcpClientConfig {
            host: cfg.tcp.host.clone(),
            port: cfg.tcp.port,
            min_send_interval: Duration::from_secs_f64(cfg.tcp.min_send_interval),
            ..TcpClientConfig::default()
        }))
    } else {
        info!("TCP event client disabled by configuration");
        None
    };
    let (event_sender, tcp_handle) = match tcp {
        Some((sender, handle)) => (Some(sender), Some(handle)),
        None => (None, None),
    };

    // ---- shutdown wiring ----
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        let _ = shutdown_tx.send(true);
    });

    // ---- workers ----
    let (bundle_tx, bundle_rx) = mpsc::channel::<FrameBundle>(PROCESSING_QUEUE_CAPACITY);

    let watcher = RecordingWatcher::new(
        recordings_root,
        cameras.cam_names().cloned().collect(),
        Duration::from_secs_f64(cfg.idle_timeout_secs),
    );
    let poll_interval = Duration::from_secs_f64(1.0 / cfg.fps_target);
    let ingest = tokio::spawn(ingest_worker(
        watcher,
        cfg.frame_skip as u64,
        poll_interval,
        bundle_tx,
        shutdown_rx.clone(),
    ));

    let stats = StageTimings::new()?;
    let processing = tokio::spawn(processing_worker(ProcessingWorker {
        bundle_rx,
        shutdown_rx,
        cameras,
        routes,
        assigner,
        detector,
        triangulator,
        tracker,
        risk_engine,
        event_sender,
        stats,
    }));

    ingest.await.context("ingest worker panicked")?;
    processing.await.context("processing worker panicked")?;

    if let Some(handle) = tcp_handle {
        handle.shutdown().await;
    }
    info!("pipeline stopped");
    Ok(())
}

async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Poll the frame source, apply 1-in-N frame skip, feed the bounded queue.
async fn ingest_worker(
    mut watcher: RecordingWatcher,
    frame_skip: u64,
    poll_interval: Duration,
    bundle_tx: mpsc::Sender<FrameBundle>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut skip_counter: u64 = 0;
    let mut dropped: u64 = 0;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        match watcher.poll() {
            Ok(Some(bundle)) => {
                skip_counter += 1;
                if skip_counter % frame_skip == 0 {
                    match bundle_tx.try_send(bundle) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(bundle)) => {
                            dropped += 1;
                            if dropped % DROP_LOG_EVERY == 1 {
                                warn!(
                                    "processing queue full, dropping bundle {} (total drops: {dropped})",
                                    bundle.frame_id
                                );
                            }
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }
                // a fresh bundle may already be waiting; poll again without
                // sleeping
                continue;
            }
            Ok(None) => {}
            Err(FrameSourceError::Stalled(d)) => {
                warn!("no new frames for {d:?}; still polling");
            }
            Err(e) => {
                warn!("frame source error: {e}");
            }
        }

        tokio::select! {
            _ = wait_shutdown(&mut shutdown_rx) => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
    debug!("ingest worker finished");
}

struct ProcessingWorker {
    bundle_rx: mpsc::Receiver<FrameBundle>,
    shutdown_rx: watch::Receiver<bool>,
    cameras: CameraSystem,
    routes: RouteStore,
    assigner: FixedRouteAssigner,
    detector: Box<dyn Detector>,
    triangulator: Triangulator,
    tracker: SessionTracker,
    risk_engine: RiskEngine,
    event_sender: Option<EventSender>,
    stats: StageTimings,
}

/// Drain the bundle queue: detect, triangulate, track, assess, emit.
async fn processing_worker(mut w: ProcessingWorker) {
    // the level last handed to the TCP client; only changes are forwarded
    let mut last_forwarded = RiskLevel::Low;
    let mut processed: u64 = 0;

    loop {
        let bundle = tokio::select! {
            _ = wait_shutdown(&mut w.shutdown_rx) => break,
            bundle = w.bundle_rx.recv() => match bundle {
                Some(bundle) => bundle,
                None => break,
            },
        };

        let frame_id = bundle.frame_id;
        let t_start = Instant::now();

        let detections = match w.detector.detect_batch(&bundle) {
            Ok(detections) => detections,
            Err(e) => {
                warn!("detection failed on bundle {frame_id}: {e}");
                continue;
            }
        };
        let t_detect = Instant::now();

        let points = w
            .triangulator
            .triangulate_frame(&w.cameras, frame_id, &detections);
        let t_triangulate = Instant::now();

        w.tracker.update(frame_id, &points);
        let tracks = w.tracker.active_tracks();
        let t_track = Instant::now();

        if let Some(assessment) = w
            .risk_engine
            .assess(frame_id, &tracks, &w.routes, &w.assigner)
        {
            if assessment.level != last_forwarded {
                info!(
                    "risk level {last_forwarded} -> {} at frame {frame_id} \
                     (score {:.0}, distance {:.1} m)",
                    assessment.level, assessment.score, assessment.hybrid_distance
                );
                if let Some(sender) = &w.event_sender {
                    sender.send_level_change(assessment.level);
                }
                last_forwarded = assessment.level;
            }
        }
        let t_risk = Instant::now();

        processed += 1;
        w.stats.record(&[
            (t_detect - t_start, Stage::Detection),
            (t_triangulate - t_detect, Stage::Triangulation),
            (t_track - t_triangulate, Stage::Tracking),
            (t_risk - t_track, Stage::Risk),
            (t_risk - t_start, Stage::Total),
        ]);

        if processed % STATS_INTERVAL == 0 {
            w.stats.log_summary(processed);
        }
        if processed % MAINTENANCE_INTERVAL == 0 {
            // periodic reclaim point; nothing to collect with manual memory
            debug!("maintenance pass after {processed} processed frames");
        }
    }

    w.tracker.finalize();
    info!(
        "processing worker finished: {processed} frames, {} completed sessions",
        w.tracker.completed_sessions().len()
    );
}

#[derive(Clone, Copy)]
enum Stage {
    Detection = 0,
    Triangulation = 1,
    Tracking = 2,
    Risk = 3,
    Total = 4,
}

const STAGE_NAMES: [&str; 5] = ["detection", "triangulation", "tracking", "risk", "total"];

/// Per-stage processing-time histograms, microsecond resolution.
struct StageTimings {
    histograms: [Histogram<u64>; 5],
}

impl StageTimings {
    fn new() -> anyhow::Result<Self> {
        let mk = || Histogram::new(3).context("histogram creation");
        Ok(Self {
            histograms: [mk()?, mk()?, mk()?, mk()?, mk()?],
        })
    }

    fn record(&mut self, samples: &[(Duration, Stage)]) {
        for (duration, stage) in samples {
            let us = duration.as_micros().min(u64::MAX as u128) as u64;
            let _ = self.histograms[*stage as usize].record(us);
        }
    }

    fn log_summary(&self, processed: u64) {
        for (h, name) in self.histograms.iter().zip(STAGE_NAMES) {
            info!(
                "{name:>13}: p50 {:.1} ms, p99 {:.1} ms, max {:.1} ms ({processed} frames)",
                h.value_at_quantile(0.5) as f64 / 1e3,
                h.value_at_quantile(0.99) as f64 / 1e3,
                h.max() as f64 / 1e3,
            );
        }
    }
}
