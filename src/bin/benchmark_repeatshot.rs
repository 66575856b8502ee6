// 该文件是 coreml-detect 项目的一部分。
// src/bin/benchmark_repeatshot.rs - 重复推理耗时测试
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

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

use coreml_detect::{
  CoreMask, Detector, FromUrl, ModelSpec,
  engine::OnnxLoader,
  input::ImageFileInput,
  output::OutputWrapper,
  task::{RepeatShotTask, Task, Thresholds},
};

/// 重复推理参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型，例如 coreml:///models/coral.onnx?classes=1
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入图像
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 标注结果输出路径
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 覆盖 URL 中的计算单元: cpu, gpu, ane, all
  #[arg(long)]
  pub mask: Option<CoreMask>,
  /// 重复次数
  #[arg(long, default_value_t = 1000)]
  pub repeat: usize,
  /// 不计入统计的预热次数
  #[arg(long, default_value_t = 2)]
  pub warmup: usize,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let mut spec = ModelSpec::from_url(&args.model)?;
  if let Some(mask) = args.mask {
    spec = spec.core_mask(mask);
  }
  let detector = Detector::load(spec, &OnnxLoader::default())?;

  let input = ImageFileInput::from_url(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?;

  let task = RepeatShotTask {
    thresholds: Thresholds::default(),
    repeat: args.repeat,
    warmup: args.warmup,
  };
  let report = task.run_task(input, &detector, output)?;
  println!(
    "{}: avg {:.2?}, min {:.2?}, max {:.2?} over {} runs",
    detector.core_mask(),
    report.average,
    report.min,
    report.max,
    report.runs
  );

  Ok(())
}
