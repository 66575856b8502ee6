// 该文件是 coreml-detect 项目的一部分。
// src/bin/stress_concurrent.rs - 并发检测压力测试
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

use anyhow::{Result, bail};
use clap::Parser;
use tracing::info;
use url::Url;

use coreml_detect::{
  Detector, FromUrl, ModelSpec,
  engine::OnnxLoader,
  input::ImageFileInput,
  output::OutputWrapper,
  task::{ConcurrentTask, Task},
};

/// 并发检测参数
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
  /// 线程数，默认为可用核心数
  #[arg(long)]
  pub threads: Option<usize>,
  /// 每个线程的检测次数
  #[arg(long, default_value_t = 20)]
  pub iterations: usize,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型: {}", args.model);
  info!("输入来源: {}", args.input);

  let spec = ModelSpec::from_url(&args.model)?;
  let detector = Detector::load(spec, &OnnxLoader::default())?;

  let input = ImageFileInput::from_url(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?;

  let mut task = ConcurrentTask {
    iterations: args.iterations,
    ..ConcurrentTask::default()
  };
  if let Some(threads) = args.threads {
    task.threads = threads;
  }

  let report = task.run_task(input, &detector, output)?;
  if !report.is_clean() {
    bail!(
      "并发检测出现异常: {} 次失败, {} 个越界结果",
      report.failures,
      report.violations
    );
  }
  println!("{} calls in {:.2?}", report.calls, report.elapsed);

  Ok(())
}
