// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 流水线端到端测试: 合成检测器 + GIF/图片输入 + 通道输出

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use image::codecs::gif::GifEncoder;
use image::{Delay, Rgba, RgbaImage};
use yolo_krypton::pipeline::SessionObserver;
use yolo_krypton::{
    BBox, ChannelSink, Command, Completion, CoordinatorSettings, Detection, Detector, Device, Frame,
    InferenceParams, ModelTier, PipelineCoordinator, PipelineError, PipelineState, SinkEvent,
    SourceDescriptor, SourceOptions,
};

const WAIT: Duration = Duration::from_secs(10);

/// 每帧返回一个 "person"
struct StubDetector {
    delay: Duration,
}

impl Detector for StubDetector {
    fn detect(&mut self, frame: &Frame, params: &InferenceParams) -> yolo_krypton::Result<Vec<Detection>> {
        thread::sleep(self.delay);
        let det = Detection {
            class_id: 0,
            class_label: "person".to_string(),
            confidence: 0.8,
            bbox: BBox::new(1.0, 1.0, frame.width() as f32 / 2.0, frame.height() as f32 / 2.0),
        };
        Ok(if det.confidence >= params.confidence { vec![det] } else { vec![] })
    }

    fn model_identifier(&self) -> String {
        "stub".to_string()
    }

    fn active_device(&self) -> Device {
        Device::Cpu
    }
}

/// 记录每一帧收到的推理参数
struct RecordingDetector {
    seen: Sender<(u64, InferenceParams)>,
}

impl Detector for RecordingDetector {
    fn detect(&mut self, frame: &Frame, params: &InferenceParams) -> yolo_krypton::Result<Vec<Detection>> {
        let _ = self.seen.send((frame.sequence_number, *params));
        StubDetector {
            delay: Duration::from_millis(2),
        }
        .detect(frame, params)
    }

    fn model_identifier(&self) -> String {
        "recording".to_string()
    }

    fn active_device(&self) -> Device {
        Device::Cpu
    }
}

struct BrokenDetector;

impl Detector for BrokenDetector {
    fn detect(&mut self, _frame: &Frame, _params: &InferenceParams) -> yolo_krypton::Result<Vec<Detection>> {
        Err(PipelineError::InferenceError("tensor shape mismatch".to_string()))
    }

    fn model_identifier(&self) -> String {
        "broken".to_string()
    }

    fn active_device(&self) -> Device {
        Device::Cpu
    }
}

fn write_gif(path: &Path, frames: u8, delay_ms: u32) {
    let file = std::fs::File::create(path).unwrap();
    let mut encoder = GifEncoder::new(file);
    for i in 0..frames {
        let buf = RgbaImage::from_pixel(16, 12, Rgba([i.wrapping_mul(10), 100, 0, 255]));
        let frame = image::Frame::from_parts(buf, 0, 0, Delay::from_numer_denom_ms(delay_ms, 1));
        encoder.encode_frame(frame).unwrap();
    }
}

fn write_png(path: &Path) {
    image::RgbImage::from_pixel(32, 24, image::Rgb([10, 20, 30])).save(path).unwrap();
}

fn settings(skip_level: u8, realtime: bool, output_dir: &Path) -> CoordinatorSettings {
    CoordinatorSettings {
        params: InferenceParams {
            device: Device::Cpu,
            ..InferenceParams::default()
        },
        skip_level,
        source_options: SourceOptions {
            realtime,
            ..SourceOptions::default()
        },
        output_dir: output_dir.to_path_buf(),
        ..CoordinatorSettings::default()
    }
}

fn coordinator(
    detector: Box<dyn Detector>,
    settings: CoordinatorSettings,
) -> (PipelineCoordinator, Receiver<SinkEvent>) {
    let (tx, rx) = bounded(1024);
    let coord = PipelineCoordinator::new(detector, Box::new(ChannelSink::new(tx)), settings);
    (coord, rx)
}

fn stub(delay_ms: u64) -> Box<dyn Detector> {
    Box::new(StubDetector {
        delay: Duration::from_millis(delay_ms),
    })
}

fn video(path: PathBuf) -> SourceDescriptor {
    SourceDescriptor::Video(path)
}

#[test]
fn ten_frame_gif_with_skip_one_yields_five_results() {
    let dir = tempfile::tempdir().unwrap();
    let clip = dir.path().join("ten.gif");
    write_gif(&clip, 10, 30);

    let (mut coord, _events) = coordinator(stub(0), settings(1, true, dir.path()));
    coord.start(video(clip)).unwrap();
    assert_eq!(coord.await_completion(WAIT), Completion::Drained);

    let status = coord.status();
    assert_eq!(status.statistics.frame_count, 5);
    assert_eq!(status.statistics.total_objects, 5);
    assert_eq!(status.counters.frames_emitted, 10);
    assert_eq!(status.counters.frames_dropped_cadence, 5);
    assert!(status.source_finished);
    coord.stop().unwrap();
}

#[test]
fn every_raw_frame_reaches_the_sink_and_skip_bound_holds() {
    let dir = tempfile::tempdir().unwrap();
    let clip = dir.path().join("fast.gif");
    write_gif(&clip, 24, 10);

    let (mut coord, events) = coordinator(stub(4), settings(2, false, dir.path()));
    coord.start(video(clip)).unwrap();
    assert_eq!(coord.await_completion(WAIT), Completion::Drained);
    let counters = coord.status().counters;
    coord.stop().unwrap();

    let mut raw = Vec::new();
    let mut inferred = Vec::new();
    for event in events.try_iter() {
        match event {
            SinkEvent::Raw(frame) => raw.push(frame.sequence_number),
            SinkEvent::Annotated(frame, result) => {
                assert_eq!(frame.sequence_number, result.source_frame_sequence_number);
                inferred.push(result.source_frame_sequence_number);
            }
            SinkEvent::Failure(e) => panic!("unexpected failure {e}"),
        }
    }

    assert_eq!(counters.frames_emitted, 24);
    assert_eq!(raw.len() as u64 + counters.frames_dropped_preview, counters.frames_emitted);
    assert!(raw.windows(2).all(|w| w[0] < w[1]));
    assert!(!inferred.is_empty());
    assert!(inferred.len() as u64 <= counters.frames_emitted);
    // 相邻两次推理至少间隔 k+1 帧
    assert!(inferred.windows(2).all(|w| w[1] - w[0] >= 3), "{inferred:?}");
    assert!(inferred.iter().all(|seq| *seq < 24));
}

#[test]
fn three_inference_failures_stop_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let clip = dir.path().join("clip.gif");
    write_gif(&clip, 10, 20);

    let (mut coord, events) = coordinator(Box::new(BrokenDetector), settings(0, true, dir.path()));
    coord.start(video(clip.clone())).unwrap();

    match coord.await_completion(WAIT) {
        Completion::Faulted(PipelineError::PipelineFailure(_)) => {}
        other => panic!("expected pipeline failure, got {other:?}"),
    }
    assert_eq!(coord.state(), PipelineState::Stopped);
    assert!(coord.status().counters.inference_failures >= 3);
    assert!(matches!(coord.pause(), Err(PipelineError::InvalidState(_))));

    let failures = events
        .try_iter()
        .filter(|e| matches!(e, SinkEvent::Failure(_)))
        .count();
    assert_eq!(failures, 1);

    // 显式重新开始
    let session = coord.start(video(clip)).unwrap();
    assert_eq!(session.state, PipelineState::Running);
    assert!(coord.status().last_error.is_none());
    coord.stop().ok();
}

#[test]
fn fatal_failure_is_visible_to_observers_without_a_command() {
    let dir = tempfile::tempdir().unwrap();
    let clip = dir.path().join("clip.gif");
    write_gif(&clip, 10, 20);

    let (mut coord, _events) = coordinator(Box::new(BrokenDetector), settings(0, true, dir.path()));
    let observer = coord.observer();
    coord.start(video(clip)).unwrap();

    let deadline = std::time::Instant::now() + WAIT;
    while observer.state() != PipelineState::Stopped {
        assert!(std::time::Instant::now() < deadline, "session never stopped");
        thread::sleep(Duration::from_millis(5));
    }
    // 不调用协调器: Stopped 与错误同时可见
    let status = observer.status();
    assert!(matches!(status.last_error, Some(PipelineError::PipelineFailure(_))));
    assert_eq!(observer.session().unwrap().state, PipelineState::Stopped);

    thread::sleep(Duration::from_millis(100));
    let emitted = observer.counters().frames_emitted;
    thread::sleep(Duration::from_millis(150));
    assert_eq!(observer.counters().frames_emitted, emitted);

    assert!(matches!(coord.resume(), Err(PipelineError::InvalidState(_))));
    assert_eq!(coord.state(), PipelineState::Stopped);
}

#[test]
fn parameter_changes_apply_to_later_frames_of_a_running_session() {
    let dir = tempfile::tempdir().unwrap();
    let clip = dir.path().join("clip.gif");
    write_gif(&clip, 40, 20);

    let (seen_tx, seen_rx) = unbounded();
    let (mut coord, events) = coordinator(
        Box::new(RecordingDetector { seen: seen_tx }),
        settings(0, true, dir.path()),
    );
    let observer = coord.observer();
    coord.start(video(clip)).unwrap();

    let deadline = std::time::Instant::now() + WAIT;
    while observer.counters().results_delivered < 3 {
        assert!(std::time::Instant::now() < deadline, "no results delivered");
        thread::sleep(Duration::from_millis(5));
    }
    coord.set_confidence(0.9).unwrap();
    coord.set_device(Device::Gpu);
    coord.set_model(ModelTier::Small);
    let changed = coord.params();

    assert_eq!(coord.await_completion(WAIT), Completion::Drained);
    coord.stop().unwrap();

    // 修改之前的帧用旧参数, 之后的帧都用新参数
    let seen: Vec<(u64, InferenceParams)> = seen_rx.try_iter().collect();
    let first_raised = seen.iter().position(|(_, p)| p.confidence == 0.9).expect("new confidence never used");
    let first_new = seen.iter().position(|(_, p)| *p == changed).expect("new params never used");
    assert!(first_raised >= 3);
    assert!(seen[..first_raised].iter().all(|(_, p)| p.confidence == 0.5));
    assert!(seen[first_raised..].iter().all(|(_, p)| p.confidence == 0.9));
    assert!(seen[first_new..].iter().all(|(_, p)| *p == changed));
    assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));

    // 置信度阈值提高后检测结果为空
    let results: Vec<usize> = events
        .try_iter()
        .filter_map(|e| match e {
            SinkEvent::Annotated(_, result) => Some(result.detections.len()),
            _ => None,
        })
        .collect();
    assert_eq!(results.len(), seen.len());
    assert!(results[..first_raised].iter().all(|n| *n == 1));
    assert!(results[first_raised..].iter().all(|n| *n == 0));
}

#[test]
fn pause_then_resume_leaves_statistics_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let img = dir.path().join("still.png");
    write_png(&img);

    let (mut coord, _events) = coordinator(stub(0), settings(0, true, dir.path()));
    coord.start(SourceDescriptor::Image(img)).unwrap();
    assert_eq!(coord.await_completion(WAIT), Completion::Drained);

    let before = coord.status();
    coord.pause().unwrap();
    coord.resume().unwrap();
    let after = coord.status();

    assert_eq!(after.state, PipelineState::Running);
    assert_eq!(after.statistics, before.statistics);
    assert_eq!(after.counters, before.counters);
    coord.stop().unwrap();
}

#[test]
fn switch_source_resets_statistics() {
    let dir = tempfile::tempdir().unwrap();
    let (a, b) = (dir.path().join("a.png"), dir.path().join("b.png"));
    write_png(&a);
    write_png(&b);

    let (mut coord, _events) = coordinator(stub(0), settings(0, true, dir.path()));
    let first = coord.start(SourceDescriptor::Image(a)).unwrap();
    assert_eq!(coord.await_completion(WAIT), Completion::Drained);
    assert_eq!(coord.status().statistics.frame_count, 1);

    let second = coord.switch_source(SourceDescriptor::Image(b)).unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(coord.await_completion(WAIT), Completion::Drained);
    let stats = coord.status().statistics;
    assert_eq!(stats.frame_count, 1);
    assert_eq!(stats.per_class_counts.get("person"), Some(&1));

    // 新输入源打不开: 会话停止,统计已清零
    let err = coord
        .switch_source(SourceDescriptor::Image(dir.path().join("missing.png")))
        .unwrap_err();
    assert!(matches!(err, PipelineError::SourceUnavailable(_)));
    assert_eq!(coord.state(), PipelineState::Stopped);
    assert!(coord.status().statistics.is_empty());
}

#[test]
fn pause_holds_results_until_resume() {
    let dir = tempfile::tempdir().unwrap();
    let clip = dir.path().join("long.gif");
    write_gif(&clip, 100, 20);

    let (mut coord, _events) = coordinator(stub(0), settings(0, true, dir.path()));
    let observer: SessionObserver = coord.observer();
    coord.start(video(clip)).unwrap();
    thread::sleep(Duration::from_millis(150));

    coord.pause().unwrap();
    coord.pause().unwrap();
    assert!(observer.session().unwrap().is_paused());
    thread::sleep(Duration::from_millis(150));
    let before = observer.counters().results_delivered;
    thread::sleep(Duration::from_millis(200));
    assert_eq!(observer.counters().results_delivered, before);
    assert!(coord.snapshot().unwrap().is_some());

    coord.resume().unwrap();
    coord.resume().unwrap();
    thread::sleep(Duration::from_millis(200));
    assert!(observer.counters().results_delivered > before);
    assert_eq!(observer.state(), PipelineState::Running);
    coord.stop().unwrap();
}

#[test]
fn stopped_session_rejects_commands_but_accepts_setters() {
    let dir = tempfile::tempdir().unwrap();
    let img = dir.path().join("still.png");
    write_png(&img);

    let (mut coord, _events) = coordinator(stub(0), settings(0, true, dir.path()));
    coord.start(SourceDescriptor::Image(img.clone())).unwrap();
    assert!(matches!(
        coord.start(SourceDescriptor::Image(img.clone())),
        Err(PipelineError::InvalidState(_))
    ));
    coord.await_completion(WAIT);
    coord.stop().unwrap();
    assert_eq!(coord.state(), PipelineState::Stopped);

    for result in [coord.pause(), coord.resume(), coord.stop()] {
        assert!(matches!(result, Err(PipelineError::InvalidState(_))));
    }
    assert!(matches!(coord.snapshot(), Err(PipelineError::InvalidState(_))));
    assert!(matches!(
        coord.switch_source(SourceDescriptor::Image(img.clone())),
        Err(PipelineError::InvalidState(_))
    ));

    coord.set_confidence(0.3).unwrap();
    coord.set_iou(0.6).unwrap();
    assert!(coord.set_confidence(1.5).is_err());
    assert_eq!(coord.set_skip_level(2), 2);
    coord.set_device(Device::Gpu);
    assert_eq!(coord.params().confidence, 0.3);
    assert_eq!(coord.params().device, Device::Gpu);
    assert!(coord.export("json", None).unwrap().exists());

    let restarted = coord.start(SourceDescriptor::Image(img)).unwrap();
    assert_eq!(restarted.frame_skip_level, 2);
    coord.stop().unwrap();
}

#[test]
fn unsupported_export_format_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (mut coord, _events) = coordinator(stub(0), settings(0, true, dir.path()));
    let target = dir.path().join("report.xml");

    let err = coord.export("xml", Some(&target)).unwrap_err();
    assert!(matches!(err, PipelineError::UnsupportedFormat(_)));
    assert!(!target.exists());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn snapshot_and_exports_are_written() {
    let dir = tempfile::tempdir().unwrap();
    let img = dir.path().join("still.png");
    write_png(&img);
    let out = dir.path().join("out");

    let (mut coord, _events) = coordinator(stub(0), settings(0, true, &out));
    coord.start(SourceDescriptor::Image(img)).unwrap();
    assert_eq!(coord.await_completion(WAIT), Completion::Drained);

    let snap = coord.snapshot_to(None).unwrap();
    assert!(snap.starts_with(&out));
    assert_eq!(image::open(&snap).unwrap().width(), 32);

    let labels = coord.export("yolo", None).unwrap();
    let text = std::fs::read_to_string(&labels).unwrap();
    assert_eq!(text.lines().count(), 1);
    assert!(text.starts_with("0 "));

    let report = coord.export("txt", Some(&dir.path().join("report.txt"))).unwrap();
    assert!(std::fs::read_to_string(report).unwrap().contains("person: 0.80"));
    coord.stop().unwrap();
}

#[test]
fn serve_runs_commands_until_the_stream_drains() {
    let dir = tempfile::tempdir().unwrap();
    let img = dir.path().join("still.png");
    write_png(&img);

    let (mut coord, _events) = coordinator(stub(0), settings(0, true, dir.path()));
    let (tx, rx) = bounded::<Command>(8);
    tx.send(Command::SetSkipLevel(1)).unwrap();
    tx.send(Command::Start(SourceDescriptor::Image(img))).unwrap();
    tx.send(Command::Status).unwrap();
    drop(tx);

    coord.serve(Box::new(rx), true).unwrap();
    assert_eq!(coord.state(), PipelineState::Stopped);
    assert_eq!(coord.status().statistics.frame_count, 1);
    assert_eq!(coord.session().unwrap().frame_skip_level, 1);
}
