// 该文件是 coreml-detect 项目的一部分。
// tests/tasks.rs - 检测任务
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

mod common;

use std::{cell::Cell, convert::Infallible, io, iter, path::PathBuf};

use coreml_detect::{
  Detection,
  output::Render,
  task::{ConcurrentTask, OneShotTask, RepeatShotTask, Task, Thresholds},
};
use image::RgbImage;

use common::{Fixture, gradient_image};

#[derive(Default)]
struct CountingOutput {
  renders: Cell<usize>,
  last: Cell<usize>,
}

impl Render for &CountingOutput {
  type Error = Infallible;

  fn render_result(&self, _image: &RgbImage, detections: &[Detection]) -> Result<(), Self::Error> {
    self.renders.set(self.renders.get() + 1);
    self.last.set(detections.len());
    Ok(())
  }
}

fn single_frame() -> impl Iterator<Item = Result<(PathBuf, RgbImage), io::Error>> {
  iter::once(Ok((PathBuf::from("frame.png"), gradient_image(128, 96))))
}

#[test]
fn one_shot_renders_first_frame() -> anyhow::Result<()> {
  let fx = Fixture::new()?;
  let detector = fx.registry.get(fx.create()).expect("live handle");
  let output = CountingOutput::default();

  let detections = OneShotTask::default().run_task(single_frame(), &detector, &output)?;
  assert!(!detections.is_empty());
  assert_eq!(output.renders.get(), 1);
  assert_eq!(output.last.get(), detections.len());
  Ok(())
}

#[test]
fn one_shot_without_input_fails() -> anyhow::Result<()> {
  let fx = Fixture::new()?;
  let detector = fx.registry.get(fx.create()).expect("live handle");
  let output = CountingOutput::default();

  let empty = iter::empty::<Result<(PathBuf, RgbImage), io::Error>>();
  assert!(OneShotTask::default().run_task(empty, &detector, &output).is_err());
  assert_eq!(output.renders.get(), 0);
  Ok(())
}

#[test]
fn repeat_shot_skips_warmup() -> anyhow::Result<()> {
  let fx = Fixture::new()?;
  let detector = fx.registry.get(fx.create()).expect("live handle");
  let output = CountingOutput::default();

  let task = RepeatShotTask {
    thresholds: Thresholds::default(),
    repeat: 12,
    warmup: 2,
  };
  let report = task.run_task(single_frame(), &detector, &output)?;
  assert_eq!(report.runs, 10);
  assert!(report.min <= report.average && report.average <= report.max);
  assert_eq!(report.detections, output.last.get());

  let bad = RepeatShotTask {
    repeat: 2,
    warmup: 2,
    ..RepeatShotTask::default()
  };
  assert!(bad.run_task(single_frame(), &detector, &output).is_err());
  Ok(())
}

#[test]
fn concurrent_task_reports_clean_run() -> anyhow::Result<()> {
  let fx = Fixture::new()?;
  let detector = fx.registry.get(fx.create()).expect("live handle");
  let output = CountingOutput::default();

  let task = ConcurrentTask {
    thresholds: Thresholds::default(),
    threads: 4,
    iterations: 25,
  };
  let report = task.run_task(single_frame(), &detector, &output)?;
  assert_eq!(report.calls, 100);
  assert!(report.is_clean(), "{:?}", report);
  Ok(())
}

#[test]
fn concurrent_task_fails_on_invalid_thresholds() -> anyhow::Result<()> {
  let fx = Fixture::new()?;
  let detector = fx.registry.get(fx.create()).expect("live handle");
  let output = CountingOutput::default();

  let task = ConcurrentTask {
    thresholds: Thresholds {
      nms: -1.0,
      confidence: 0.25,
    },
    threads: 2,
    iterations: 3,
  };
  assert!(task.run_task(single_frame(), &detector, &output).is_err());
  Ok(())
}
