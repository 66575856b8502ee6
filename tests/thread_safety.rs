// 该文件是 coreml-detect 项目的一部分。
// tests/thread_safety.rs - 并发调用
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

use std::{sync::atomic::Ordering, thread, time::Duration};

use coreml_detect::CoreMask;

use common::{Fixture, ScriptedLoader, gradient_image};

fn run_shared_handle(threads: usize, iterations: usize) -> anyhow::Result<()> {
  let loader = ScriptedLoader {
    delay: Duration::from_micros(200),
    ..ScriptedLoader::default()
  };
  let fx = Fixture::with_loader(loader)?;
  let handle = fx.create();
  assert_ne!(handle, 0);

  let image = gradient_image(128, 96);
  let expected = fx.registry.detect(handle, &image, 0.45, 0.25);
  assert!(!expected.is_empty());

  thread::scope(|scope| {
    for _ in 0..threads {
      scope.spawn(|| {
        for _ in 0..iterations {
          let detections = fx.registry.detect(handle, &image, 0.45, 0.25);
          assert_eq!(detections, expected);
        }
      });
    }
  });

  assert_eq!(fx.loader.overlaps.load(Ordering::SeqCst), 0);
  assert_eq!(
    fx.loader.calls.load(Ordering::SeqCst),
    threads * iterations + 1
  );

  fx.registry.destroy(handle);
  Ok(())
}

#[test]
fn four_threads_share_one_handle() -> anyhow::Result<()> {
  run_shared_handle(4, 100)
}

#[test]
fn all_cores_share_one_handle() -> anyhow::Result<()> {
  let threads = thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
  run_shared_handle(threads, 20)
}

#[test]
fn reconfigure_while_detecting() -> anyhow::Result<()> {
  let fx = Fixture::new()?;
  let handle = fx.create();
  let image = gradient_image(128, 96);

  thread::scope(|scope| {
    scope.spawn(|| {
      for i in 0..200 {
        let mask = CoreMask::ALL[i % CoreMask::ALL.len()];
        assert_eq!(fx.registry.set_core_mask(handle, mask.ordinal()), 0);
      }
    });
    for _ in 0..3 {
      scope.spawn(|| {
        for _ in 0..100 {
          assert!(!fx.registry.detect(handle, &image, 0.45, 0.25).is_empty());
        }
      });
    }
  });

  fx.registry.destroy(handle);
  Ok(())
}

#[test]
fn create_and_destroy_race_with_detect() -> anyhow::Result<()> {
  let fx = Fixture::new()?;
  let image = gradient_image(64, 48);
  let victim = fx.create();

  thread::scope(|scope| {
    scope.spawn(|| {
      for _ in 0..50 {
        let handle = fx.create();
        assert_ne!(handle, 0);
        fx.registry.destroy(handle);
      }
      fx.registry.destroy(victim);
    });
    scope.spawn(|| {
      // 句柄被释放后只会得到空结果
      for _ in 0..200 {
        let _ = fx.registry.detect(victim, &image, 0.45, 0.25);
      }
    });
  });

  assert!(fx.registry.detect(victim, &image, 0.45, 0.25).is_empty());
  assert!(fx.registry.is_empty());
  Ok(())
}
