// 该文件是 coreml-detect 项目的一部分。
// src/jvm.rs - JNI 接口
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

//! `org.atomstorm.coreml.CoreMLJNI` 的本地方法。
//!
//! 失败只通过返回值表达：句柄 0、非零状态码或空数组，不会抛出 Java 异常，
//! panic 也不会越过 JNI 边界。
//!
//! `detect` 的 `imagePtr` 是 `registerImage` 返回的图像句柄，而不是
//! `cv::Mat` 的本地地址；传入 `Mat.getNativeObjAddr()` 只会得到空数组。
//! 宿主需先用 `registerImage(byte[] rgb, int width, int height)` 登记紧密排列的
//! RGB8 数据，用完后调用 `releaseImage`。

use std::{ffi::c_void, sync::OnceLock};

use ::jni::{
  JNIEnv, JavaVM,
  objects::{GlobalRef, JByteArray, JClass, JObject, JObjectArray, JString, JValue},
  sys::{JNI_ERR, JNI_VERSION_1_8, jdouble, jint, jlong, jobjectArray},
};
use image::RgbImage;
use tracing::{error, warn};

use crate::{
  ffi::guard,
  model::Detection,
  registry::{self, StatusCode},
};

const RESULT_CLASS: &str = "org/atomstorm/coreml/CoreMLJNI$CoreMLResult";
// CoreMLResult(int left, int top, int right, int bottom, float conf, int class_id)
const RESULT_CTOR: &str = "(IIIIFI)V";

static RESULT_CLASS_REF: OnceLock<GlobalRef> = OnceLock::new();

fn clear_exception(env: &mut JNIEnv) {
  if env.exception_check().unwrap_or(false) {
    let _ = env.exception_clear();
  }
}

fn to_handle(value: jlong) -> u64 {
  if value <= 0 { 0 } else { value as u64 }
}

/// 结果类在加载时解析一次；本地线程上的 `FindClass` 看不到应用的类加载器
fn result_class(env: &mut JNIEnv) -> ::jni::errors::Result<&'static GlobalRef> {
  if let Some(class) = RESULT_CLASS_REF.get() {
    return Ok(class);
  }
  let local = env.find_class(RESULT_CLASS)?;
  let global = env.new_global_ref(local)?;
  Ok(RESULT_CLASS_REF.get_or_init(|| global))
}

#[unsafe(no_mangle)]
pub extern "system" fn JNI_OnLoad(vm: JavaVM, _reserved: *mut c_void) -> jint {
  let mut env = match vm.get_env() {
    Ok(env) => env,
    Err(e) => {
      error!("无法获取 JNIEnv: {}", e);
      return JNI_ERR;
    }
  };
  if let Err(e) = result_class(&mut env) {
    error!("无法解析 {}: {}", RESULT_CLASS, e);
    clear_exception(&mut env);
    return JNI_ERR;
  }
  JNI_VERSION_1_8
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_org_atomstorm_coreml_CoreMLJNI_create<'local>(
  mut env: JNIEnv<'local>,
  _class: JClass<'local>,
  model_path: JString<'local>,
  num_classes: jint,
  model_ver: jint,
  core_mask: jint,
) -> jlong {
  guard("CoreMLJNI.create", 0, move || {
    if model_path.is_null() {
      error!("模型路径为 null");
      return 0;
    }
    let path: String = match env.get_string(&model_path) {
      Ok(s) => s.into(),
      Err(e) => {
        error!("无法读取模型路径: {}", e);
        clear_exception(&mut env);
        return 0;
      }
    };

    registry::create(&path, num_classes, model_ver, core_mask) as jlong
  })
}

/// 读取 `CoreMLJNI.CoreMask` 枚举的序号
fn core_mask_ordinal(env: &mut JNIEnv, desired_core: &JObject) -> Option<jint> {
  if desired_core.is_null() {
    return None;
  }
  match env
    .call_method(desired_core, "ordinal", "()I", &[])
    .and_then(|value| value.i())
  {
    Ok(ordinal) => Some(ordinal),
    Err(e) => {
      error!("无法读取计算单元序号: {}", e);
      clear_exception(env);
      None
    }
  }
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_org_atomstorm_coreml_CoreMLJNI_setCoreMask<'local>(
  mut env: JNIEnv<'local>,
  _class: JClass<'local>,
  ptr: jlong,
  desired_core: JObject<'local>,
) -> jint {
  guard("CoreMLJNI.setCoreMask", StatusCode::EngineFailure.into(), move || {
    let Some(ordinal) = core_mask_ordinal(&mut env, &desired_core) else {
      warn!("设置计算单元: 计算单元为空或无法读取");
      return StatusCode::InvalidCoreMask.into();
    };
    registry::set_core_mask(to_handle(ptr), ordinal)
  })
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_org_atomstorm_coreml_CoreMLJNI_destroy<'local>(
  _env: JNIEnv<'local>,
  _class: JClass<'local>,
  ptr: jlong,
) {
  guard("CoreMLJNI.destroy", (), || registry::destroy(to_handle(ptr)))
}

fn build_results<'local>(
  env: &mut JNIEnv<'local>,
  detections: &[Detection],
) -> ::jni::errors::Result<JObjectArray<'local>> {
  let class: &JClass = result_class(env)?.as_obj().into();
  let array = env.new_object_array(detections.len() as i32, class, JObject::null())?;

  for (i, det) in detections.iter().enumerate() {
    let obj = env.new_object(
      class,
      RESULT_CTOR,
      &[
        JValue::Int(det.left),
        JValue::Int(det.top),
        JValue::Int(det.right),
        JValue::Int(det.bottom),
        JValue::Float(det.confidence),
        JValue::Int(det.class_id),
      ],
    )?;
    env.set_object_array_element(&array, i as i32, &obj)?;
    env.delete_local_ref(obj)?;
  }

  Ok(array)
}

fn empty_results(env: &mut JNIEnv) -> jobjectArray {
  match build_results(env, &[]) {
    Ok(array) => array.into_raw(),
    Err(e) => {
      error!("无法构造空结果数组: {}", e);
      clear_exception(env);
      std::ptr::null_mut()
    }
  }
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_org_atomstorm_coreml_CoreMLJNI_detect<'local>(
  mut env: JNIEnv<'local>,
  _class: JClass<'local>,
  detector_ptr: jlong,
  image_ptr: jlong,
  nms_thresh: jdouble,
  box_thresh: jdouble,
) -> jobjectArray {
  let detections = guard("CoreMLJNI.detect", Vec::new(), || {
    registry::detect(to_handle(detector_ptr), to_handle(image_ptr), nms_thresh, box_thresh)
  });

  guard("CoreMLJNI.detect", std::ptr::null_mut(), move || {
    match build_results(&mut env, &detections) {
      Ok(array) => array.into_raw(),
      Err(e) => {
        error!("无法构造检测结果数组: {}", e);
        clear_exception(&mut env);
        // 退回到空数组
        empty_results(&mut env)
      }
    }
  })
}

/// 登记一幅紧密排列的 RGB8 图像，返回供 `detect` 使用的图像句柄
#[unsafe(no_mangle)]
pub extern "system" fn Java_org_atomstorm_coreml_CoreMLJNI_registerImage<'local>(
  mut env: JNIEnv<'local>,
  _class: JClass<'local>,
  rgb: JByteArray<'local>,
  width: jint,
  height: jint,
) -> jlong {
  guard("CoreMLJNI.registerImage", 0, move || {
    if rgb.is_null() || width <= 0 || height <= 0 {
      warn!("图像参数无效: {}x{}", width, height);
      return 0;
    }
    let bytes = match env.convert_byte_array(&rgb) {
      Ok(bytes) => bytes,
      Err(e) => {
        error!("无法读取图像数据: {}", e);
        clear_exception(&mut env);
        return 0;
      }
    };

    match RgbImage::from_raw(width as u32, height as u32, bytes) {
      Some(image) => registry::register_image(image) as jlong,
      None => {
        warn!("图像数据长度与 {}x{} 不匹配", width, height);
        0
      }
    }
  })
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_org_atomstorm_coreml_CoreMLJNI_releaseImage<'local>(
  _env: JNIEnv<'local>,
  _class: JClass<'local>,
  image_ptr: jlong,
) {
  guard("CoreMLJNI.releaseImage", (), || {
    registry::release_image(to_handle(image_ptr));
  })
}
