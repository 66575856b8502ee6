// 该文件是 coreml-detect 项目的一部分。
// src/task.rs - 检测任务
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 AtomStorm

use std::{
  path::PathBuf,
  sync::atomic::{AtomicUsize, Ordering},
  thread,
  time::{Duration, Instant},
};

use anyhow::anyhow;
use image::RgbImage;
use tracing::{debug, info, warn};

use crate::{detector::Detector, model::Detection, output::Render};

pub trait Task<I, O>: Sized {
  type Output;
  type Error;
  fn run_task(self, input: I, detector: &Detector, output: O) -> Result<Self::Output, Self::Error>;
}

/// NMS 与置信度阈值
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
  pub nms: f64,
  pub confidence: f64,
}

impl Default for Thresholds {
  fn default() -> Self {
    Self {
      nms: 0.45,
      confidence: 0.25,
    }
  }
}

fn first_frame<I, E>(mut input: I) -> anyhow::Result<(PathBuf, RgbImage)>
where
  I: Iterator<Item = Result<(PathBuf, RgbImage), E>>,
  E: std::error::Error + Send + Sync + 'static,
{
  let frame = input.next().ok_or_else(|| anyhow!("没有输入帧"))??;
  Ok(frame)
}

/// 对第一帧运行一次检测并渲染
#[derive(Debug, Default)]
pub struct OneShotTask {
  pub thresholds: Thresholds,
}

impl<I, O, E, RE> Task<I, O> for OneShotTask
where
  I: Iterator<Item = Result<(PathBuf, RgbImage), E>>,
  E: std::error::Error + Send + Sync + 'static,
  O: Render<Error = RE>,
  RE: std::error::Error + Send + Sync + 'static,
{
  type Output = Vec<Detection>;
  type Error = anyhow::Error;

  fn run_task(self, input: I, detector: &Detector, output: O) -> Result<Self::Output, Self::Error> {
    info!("开始任务...");
    let (path, image) = first_frame(input)?;
    info!("输入帧获取成功 ({})，开始推理...", path.display());

    let now = Instant::now();
    let detections = detector.detect(&image, self.thresholds.nms, self.thresholds.confidence)?;
    let elapsed = now.elapsed();
    info!("推理完成，检测到 {} 个物体，耗时: {:.2?}", detections.len(), elapsed);

    output.render_result(&image, &detections)?;
    info!("渲染完成，耗时: {:.2?}", now.elapsed());

    Ok(detections)
  }
}

/// 重复检测的耗时统计，不含预热轮次
#[derive(Debug, Clone)]
pub struct BenchmarkReport {
  pub runs: usize,
  pub average: Duration,
  pub min: Duration,
  pub max: Duration,
  pub detections: usize,
}

/// 对同一帧反复检测，用于测量推理耗时
#[derive(Debug)]
pub struct RepeatShotTask {
  pub thresholds: Thresholds,
  pub repeat: usize,
  pub warmup: usize,
}

impl Default for RepeatShotTask {
  fn default() -> Self {
    Self {
      thresholds: Thresholds::default(),
      repeat: 1000,
      warmup: 2,
    }
  }
}

impl<I, O, E, RE> Task<I, O> for RepeatShotTask
where
  I: Iterator<Item = Result<(PathBuf, RgbImage), E>>,
  E: std::error::Error + Send + Sync + 'static,
  O: Render<Error = RE>,
  RE: std::error::Error + Send + Sync + 'static,
{
  type Output = BenchmarkReport;
  type Error = anyhow::Error;

  fn run_task(self, input: I, detector: &Detector, output: O) -> Result<Self::Output, Self::Error> {
    if self.repeat <= self.warmup {
      return Err(anyhow!(
        "重复次数 {} 必须大于预热次数 {}",
        self.repeat,
        self.warmup
      ));
    }

    info!("开始任务...");
    let (_, image) = first_frame(input)?;
    info!("输入帧获取成功，开始推理...");

    let mut times = Vec::with_capacity(self.repeat);
    let mut last = Vec::new();
    for i in 0..self.repeat {
      let now = Instant::now();
      last = detector.detect(&image, self.thresholds.nms, self.thresholds.confidence)?;
      let elapsed = now.elapsed();
      debug!("({})推理完成，耗时: {:.2?}", i, elapsed);
      times.push(elapsed);
    }
    output.render_result(&image, &last)?;

    let measured = &times[self.warmup..];
    let report = BenchmarkReport {
      runs: measured.len(),
      average: measured.iter().sum::<Duration>() / measured.len() as u32,
      min: measured.iter().min().copied().unwrap_or_default(),
      max: measured.iter().max().copied().unwrap_or_default(),
      detections: last.len(),
    };
    warn!(
      "平均推理时间: {:.2?} (最短 {:.2?}, 最长 {:.2?}, {} 次)",
      report.average, report.min, report.max, report.runs
    );

    Ok(report)
  }
}

/// 并发检测的统计结果
#[derive(Debug, Clone, Default)]
pub struct StressReport {
  pub calls: usize,
  pub failures: usize,
  pub violations: usize,
  pub elapsed: Duration,
}

impl StressReport {
  pub fn is_clean(&self) -> bool {
    self.failures == 0 && self.violations == 0
  }
}

/// 多个线程共享同一个检测器并发检测
#[derive(Debug)]
pub struct ConcurrentTask {
  pub thresholds: Thresholds,
  pub threads: usize,
  pub iterations: usize,
}

impl Default for ConcurrentTask {
  fn default() -> Self {
    Self {
      thresholds: Thresholds::default(),
      threads: thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
      iterations: 20,
    }
  }
}

impl<I, O, E, RE> Task<I, O> for ConcurrentTask
where
  I: Iterator<Item = Result<(PathBuf, RgbImage), E>>,
  E: std::error::Error + Send + Sync + 'static,
  O: Render<Error = RE>,
  RE: std::error::Error + Send + Sync + 'static,
{
  type Output = StressReport;
  type Error = anyhow::Error;

  fn run_task(self, input: I, detector: &Detector, output: O) -> Result<Self::Output, Self::Error> {
    info!("开始任务: {} 线程 x {} 次", self.threads, self.iterations);
    let (_, image) = first_frame(input)?;
    let (width, height) = image.dimensions();

    let baseline = detector.detect(&image, self.thresholds.nms, self.thresholds.confidence)?;
    output.render_result(&image, &baseline)?;

    let failures = AtomicUsize::new(0);
    let violations = AtomicUsize::new(0);
    let now = Instant::now();

    thread::scope(|scope| {
      for t in 0..self.threads {
        let (image, failures, violations) = (&image, &failures, &violations);
        scope.spawn(move || {
          for i in 0..self.iterations {
            match detector.detect(image, self.thresholds.nms, self.thresholds.confidence) {
              Ok(detections) => {
                let bad = detections
                  .iter()
                  .filter(|d| {
                    !d.is_within(width, height)
                      || !(0.0..=1.0).contains(&d.confidence)
                      || d.class_id < 0
                  })
                  .count();
                if bad > 0 {
                  warn!("线程 {} 第 {} 次: {} 个结果越界", t, i, bad);
                  violations.fetch_add(bad, Ordering::Relaxed);
                }
              }
              Err(e) => {
                warn!("线程 {} 第 {} 次检测失败: {}", t, i, e);
                failures.fetch_add(1, Ordering::Relaxed);
              }
            }
          }
        });
      }
    });

    let report = StressReport {
      calls: self.threads * self.iterations,
      failures: failures.into_inner(),
      violations: violations.into_inner(),
      elapsed: now.elapsed(),
    };
    info!(
      "并发检测完成: {} 次调用, {} 次失败, {} 个越界结果, 耗时 {:.2?}",
      report.calls, report.failures, report.violations, report.elapsed
    );

    Ok(report)
  }
}
