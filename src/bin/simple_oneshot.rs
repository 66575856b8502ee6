// 该文件是 coreml-detect 项目的一部分。
// src/bin/simple_oneshot.rs - 单次推理
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
use serde_json::json;
use tracing::info;
use url::Url;

use coreml_detect::{
  Detector, FromUrl, ModelSpec,
  engine::OnnxLoader,
  input::ImageFileInput,
  output::OutputWrapper,
  task::{OneShotTask, Task, Thresholds},
};

/// 单次推理参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型，例如 coreml:///models/coral.onnx?classes=1&version=v11&mask=all
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入图像，例如 image:///data/coral.jpeg
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 标注结果输出路径
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 覆盖模型输入宽度，默认从模型读取
  #[arg(long, requires = "height")]
  pub width: Option<u32>,
  /// 覆盖模型输入高度，默认从模型读取
  #[arg(long, requires = "width")]
  pub height: Option<u32>,
  /// NMS IoU 阈值
  #[arg(long, default_value_t = 0.45)]
  pub nms: f64,
  /// 置信度阈值
  #[arg(long = "box", default_value_t = 0.25)]
  pub box_threshold: f64,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let spec = ModelSpec::from_url(&args.model)?;
  let mut loader = OnnxLoader::default();
  if let (Some(width), Some(height)) = (args.width, args.height) {
    loader = loader.input_size(width, height);
  }
  let detector = Detector::load(spec, &loader)?;

  let input = ImageFileInput::from_url(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?;

  let task = OneShotTask {
    thresholds: Thresholds {
      nms: args.nms,
      confidence: args.box_threshold,
    },
  };
  let detections = task.run_task(input, &detector, output)?;

  let results: Vec<_> = detections
    .iter()
    .map(|d| {
      json!({
        "left": d.left,
        "top": d.top,
        "right": d.right,
        "bottom": d.bottom,
        "confidence": d.confidence,
        "class_id": d.class_id,
      })
    })
    .collect();
  println!("{}", serde_json::to_string_pretty(&results)?);

  Ok(())
}
