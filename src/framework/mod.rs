// 该文件是 Shanan （山南西风） 项目的一部分。
// src/framework/mod.rs - 推理框架抽象
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::path::{Path, PathBuf};

use ndarray::{Array4, ArrayD, IxDyn};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::{BackendKind, Config, QuantizationMode};

#[cfg(feature = "framework_onnx")]
mod onnx;
#[cfg(feature = "framework_openvino")]
mod vino;
#[cfg(feature = "framework_tf")]
mod tf;
#[cfg(feature = "framework_tflite")]
mod tflite;
#[cfg(feature = "framework_torch")]
mod torch;

#[cfg(feature = "framework_onnx")]
pub use self::onnx::YoloOnnx;
#[cfg(feature = "framework_openvino")]
pub use self::vino::YoloVino;
#[cfg(feature = "framework_tf")]
pub use self::tf::{YoloOnnxTf, YoloTf};
#[cfg(feature = "framework_tflite")]
pub use self::tflite::YoloTfLite;
#[cfg(feature = "framework_torch")]
pub use self::torch::YoloTorch;

#[derive(Error, Debug)]
pub enum FrameworkError {
  #[error("推理框架 {0} 未编译进本程序")]
  NotCompiled(BackendKind),
  #[error("模型文件不存在: {}", .0.display())]
  ArtifactMissing(PathBuf),
  #[error("模型无效: {}, 错误: {reason}", .path.display())]
  ArtifactMalformed { path: PathBuf, reason: String },
  #[error("张量形状不匹配: {0}")]
  ShapeMismatch(String),
  #[error("输入不匹配: {0}")]
  InputMismatch(String),
  #[error("推理引擎错误: {0}")]
  Engine(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl FrameworkError {
  pub fn malformed(path: &Path, reason: impl ToString) -> Self {
    FrameworkError::ArtifactMalformed {
      path: path.to_path_buf(),
      reason: reason.to_string(),
    }
  }

  pub fn engine<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
    FrameworkError::Engine(Box::new(err))
  }

  pub(crate) fn poisoned() -> Self {
    FrameworkError::Engine("推理上下文锁已中毒".into())
  }
}

/// 输入张量，带批次维（大小为 1）
#[derive(Debug, Clone, PartialEq)]
pub enum InputTensor {
  Float32(Array4<f32>),
  UInt8(Array4<u8>),
}

impl InputTensor {
  pub fn shape(&self) -> &[usize] {
    match self {
      InputTensor::Float32(t) => t.shape(),
      InputTensor::UInt8(t) => t.shape(),
    }
  }

  pub fn as_f32(&self) -> Result<&Array4<f32>, FrameworkError> {
    match self {
      InputTensor::Float32(t) => Ok(t),
      InputTensor::UInt8(_) => Err(FrameworkError::InputMismatch(
        "期望 f32 输入, 实际为 u8".to_string(),
      )),
    }
  }

  pub fn as_u8(&self) -> Result<&Array4<u8>, FrameworkError> {
    match self {
      InputTensor::UInt8(t) => Ok(t),
      InputTensor::Float32(_) => Err(FrameworkError::InputMismatch(
        "期望 u8 输入, 实际为 f32".to_string(),
      )),
    }
  }
}

/// 按名字喂给模型的唯一输入
#[derive(Debug, Clone, PartialEq)]
pub struct InputFeed {
  pub name: String,
  pub tensor: InputTensor,
}

impl InputFeed {
  pub(crate) fn expect_name(&self, name: &str) -> Result<(), FrameworkError> {
    if self.name != name {
      error!("输入名称不匹配: 期望 {}, 实际为 {}", name, self.name);
      return Err(FrameworkError::InputMismatch(format!(
        "期望输入 {}, 实际为 {}",
        name, self.name
      )));
    }
    Ok(())
  }
}

/// 推理框架统一接口: 按名字输入一个张量, 按固定顺序输出去掉批次维的张量
pub trait Framework {
  fn kind(&self) -> BackendKind;
  fn input_name(&self) -> &str;
  fn inference(&self, feed: &InputFeed) -> Result<Vec<ArrayD<f32>>, FrameworkError>;
}

/// 模型文件位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactPath {
  File(PathBuf),
  Directory(PathBuf),
}

impl ArtifactPath {
  pub fn resolve(config: &Config) -> Self {
    let dir = &config.weights_dir;
    let model = config.model.as_str();
    match config.framework {
      BackendKind::Tf => ArtifactPath::File(dir.join(format!("{model}.pb"))),
      BackendKind::TfLite => {
        let quantize = config.quantize.unwrap_or(QuantizationMode::Fp32);
        ArtifactPath::File(dir.join(format!("{model}_{quantize}.tflite")))
      }
      BackendKind::TfOnnx => ArtifactPath::File(dir.join(format!("tf_{model}.onnx"))),
      BackendKind::OnnxTf => ArtifactPath::Directory(dir.join(format!("onnx_tf_{model}"))),
      BackendKind::OnnxVino => ArtifactPath::Directory(dir.join(format!("onnx_vino_{model}"))),
      BackendKind::TorchOnnx => ArtifactPath::File(dir.join(format!("{model}.onnx"))),
      BackendKind::Torch => ArtifactPath::File(dir.join(format!("{model}.pt"))),
    }
  }

  pub fn path(&self) -> &Path {
    match self {
      ArtifactPath::File(p) | ArtifactPath::Directory(p) => p,
    }
  }

  pub fn ensure_exists(&self) -> Result<(), FrameworkError> {
    let present = match self {
      ArtifactPath::File(p) => p.is_file(),
      ArtifactPath::Directory(p) => p.is_dir(),
    };
    if !present {
      error!("模型文件不存在: {}", self.path().display());
      return Err(FrameworkError::ArtifactMissing(self.path().to_path_buf()));
    }
    Ok(())
  }
}

/// 检查模型声明的输入空间尺寸
pub(crate) fn check_resolution(
  kind: BackendKind,
  dims: &[i64],
  axes: (usize, usize),
  expected: usize,
) -> Result<(), FrameworkError> {
  let h = dims.get(axes.0).copied();
  let w = dims.get(axes.1).copied();
  if h != Some(expected as i64) || w != Some(expected as i64) {
    error!(
      "{} 模型输入尺寸不匹配: 期望 {}x{}, 实际形状 {:?}",
      kind, expected, expected, dims
    );
    return Err(FrameworkError::ShapeMismatch(format!(
      "{kind} 模型输入形状 {dims:?} 与分辨率 {expected} 不符"
    )));
  }
  Ok(())
}

/// 去掉批次维，批次大小必须为 1
pub fn squeeze_batch(shape: &[usize], data: Vec<f32>) -> Result<ArrayD<f32>, FrameworkError> {
  match shape.split_first() {
    Some((1, rest)) => ArrayD::from_shape_vec(IxDyn(rest), data)
      .map_err(|e| FrameworkError::ShapeMismatch(format!("输出形状 {shape:?}: {e}"))),
    _ => Err(FrameworkError::ShapeMismatch(format!(
      "输出形状 {shape:?} 的批次维不为 1"
    ))),
  }
}

/// 单个张量的量化参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantParams {
  pub scale: f32,
  pub zero_point: i32,
}

impl QuantParams {
  pub fn dequantize<T: Copy + Into<f32>>(&self, raw: &[T]) -> Vec<f32> {
    let zero_point = self.zero_point as f32;
    raw
      .iter()
      .map(|&v| (v.into() - zero_point) * self.scale)
      .collect()
  }
}

/// 引擎输出的原始数据，按元素类型区分
#[derive(Debug, Clone, PartialEq)]
pub enum OutputData<'a> {
  F32(&'a [f32]),
  U8(&'a [u8]),
  I8(&'a [i8]),
  Unsupported(String),
}

impl OutputData<'_> {
  /// 整数输出按量化参数反量化，f32 输出原样复制
  pub fn into_f32(self, params: Option<QuantParams>) -> Result<Vec<f32>, FrameworkError> {
    match (self, params) {
      (OutputData::F32(raw), _) => Ok(raw.to_vec()),
      (OutputData::U8(raw), Some(params)) => Ok(params.dequantize(raw)),
      (OutputData::I8(raw), Some(params)) => Ok(params.dequantize(raw)),
      (OutputData::U8(_) | OutputData::I8(_), None) => {
        error!("整数输出缺少量化参数");
        Err(FrameworkError::ShapeMismatch(
          "整数输出缺少量化参数".to_string(),
        ))
      }
      (OutputData::Unsupported(dtype), _) => {
        error!("不支持的输出类型: {}", dtype);
        Err(FrameworkError::ShapeMismatch(format!(
          "不支持的输出类型 {dtype}"
        )))
      }
    }
  }
}

/// `torch_onnx` 与 `onnx_vino` 模型唯一使用的输出名
pub const SINGLE_OUTPUT: &str = "output";

/// 从模型声明的输出中选出要取回的输出，并确定其顺序
pub fn select_outputs(kind: BackendKind, declared: &[String]) -> Result<Vec<String>, FrameworkError> {
  if declared.is_empty() {
    error!("{} 模型没有声明任何输出", kind);
    return Err(FrameworkError::ShapeMismatch(format!(
      "{kind} 模型没有声明任何输出"
    )));
  }
  match kind {
    BackendKind::TorchOnnx | BackendKind::OnnxVino => {
      if declared.iter().any(|n| n == SINGLE_OUTPUT) {
        Ok(vec![SINGLE_OUTPUT.to_string()])
      } else {
        error!("{} 模型缺少输出 {}: {:?}", kind, SINGLE_OUTPUT, declared);
        Err(FrameworkError::ShapeMismatch(format!(
          "{kind} 模型缺少输出 {SINGLE_OUTPUT}"
        )))
      }
    }
    // SavedModel 签名输出无序
    BackendKind::OnnxTf => {
      let mut sorted = declared.to_vec();
      sorted.sort();
      Ok(sorted)
    }
    BackendKind::Tf | BackendKind::TfLite | BackendKind::TfOnnx | BackendKind::Torch => {
      Ok(declared.to_vec())
    }
  }
}

/// 所有受支持的推理框架，只包含编译时启用的引擎
pub enum Backend {
  #[cfg(feature = "framework_tf")]
  Tf(YoloTf),
  #[cfg(feature = "framework_tf")]
  OnnxTf(YoloOnnxTf),
  #[cfg(feature = "framework_tflite")]
  TfLite(YoloTfLite),
  #[cfg(feature = "framework_onnx")]
  Onnx(YoloOnnx),
  #[cfg(feature = "framework_openvino")]
  Vino(YoloVino),
  #[cfg(feature = "framework_torch")]
  Torch(YoloTorch),
}

impl Backend {
  pub fn new(config: &Config) -> Result<Self, FrameworkError> {
    let artifact = ArtifactPath::resolve(config);
    info!(
      "加载 {} 模型 {}: {}",
      config.framework,
      config.model,
      artifact.path().display()
    );
    artifact.ensure_exists()?;

    let backend = match config.framework {
      #[cfg(feature = "framework_tf")]
      BackendKind::Tf => Backend::Tf(YoloTf::new(config, &artifact)?),
      #[cfg(feature = "framework_tf")]
      BackendKind::OnnxTf => Backend::OnnxTf(YoloOnnxTf::new(config, &artifact)?),
      #[cfg(feature = "framework_tflite")]
      BackendKind::TfLite => Backend::TfLite(YoloTfLite::new(config, &artifact)?),
      #[cfg(feature = "framework_onnx")]
      BackendKind::TfOnnx | BackendKind::TorchOnnx => {
        Backend::Onnx(YoloOnnx::new(config, &artifact)?)
      }
      #[cfg(feature = "framework_openvino")]
      BackendKind::OnnxVino => Backend::Vino(YoloVino::new(config, &artifact)?),
      #[cfg(feature = "framework_torch")]
      BackendKind::Torch => Backend::Torch(YoloTorch::new(config, &artifact)?),
      #[allow(unreachable_patterns)]
      kind => {
        error!("推理框架 {} 未启用, 请打开对应的 cargo feature", kind);
        return Err(FrameworkError::NotCompiled(kind));
      }
    };
    info!("模型加载完成");
    Ok(backend)
  }
}

impl Framework for Backend {
  fn kind(&self) -> BackendKind {
    match *self {
      #[cfg(feature = "framework_tf")]
      Backend::Tf(ref f) => f.kind(),
      #[cfg(feature = "framework_tf")]
      Backend::OnnxTf(ref f) => f.kind(),
      #[cfg(feature = "framework_tflite")]
      Backend::TfLite(ref f) => f.kind(),
      #[cfg(feature = "framework_onnx")]
      Backend::Onnx(ref f) => f.kind(),
      #[cfg(feature = "framework_openvino")]
      Backend::Vino(ref f) => f.kind(),
      #[cfg(feature = "framework_torch")]
      Backend::Torch(ref f) => f.kind(),
    }
  }

  fn input_name(&self) -> &str {
    match *self {
      #[cfg(feature = "framework_tf")]
      Backend::Tf(ref f) => f.input_name(),
      #[cfg(feature = "framework_tf")]
      Backend::OnnxTf(ref f) => f.input_name(),
      #[cfg(feature = "framework_tflite")]
      Backend::TfLite(ref f) => f.input_name(),
      #[cfg(feature = "framework_onnx")]
      Backend::Onnx(ref f) => f.input_name(),
      #[cfg(feature = "framework_openvino")]
      Backend::Vino(ref f) => f.input_name(),
      #[cfg(feature = "framework_torch")]
      Backend::Torch(ref f) => f.input_name(),
    }
  }

  fn inference(&self, feed: &InputFeed) -> Result<Vec<ArrayD<f32>>, FrameworkError> {
    debug!("执行 {} 推理, 输入形状 {:?}", self.kind(), feed.tensor.shape());
    match *self {
      #[cfg(feature = "framework_tf")]
      Backend::Tf(ref f) => f.inference(feed),
      #[cfg(feature = "framework_tf")]
      Backend::OnnxTf(ref f) => f.inference(feed),
      #[cfg(feature = "framework_tflite")]
      Backend::TfLite(ref f) => f.inference(feed),
      #[cfg(feature = "framework_onnx")]
      Backend::Onnx(ref f) => f.inference(feed),
      #[cfg(feature = "framework_openvino")]
      Backend::Vino(ref f) => f.inference(feed),
      #[cfg(feature = "framework_torch")]
      Backend::Torch(ref f) => f.inference(feed),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::ModelVariant;

  #[test]
  fn dequantize_uses_zero_point_and_scale() {
    let params = QuantParams {
      scale: 0.5,
      zero_point: 128,
    };
    assert_eq!(params.dequantize(&[0u8, 128, 255]), vec![-64.0, 0.0, 63.5]);
    assert_eq!(params.dequantize(&[-128i8]), vec![-128.0]);
  }

  #[test]
  fn squeeze_batch_removes_leading_axis() {
    let out = squeeze_batch(&[1, 2, 3], (0..6).map(|v| v as f32).collect()).unwrap();
    assert_eq!(out.shape(), &[2, 3]);
    assert_eq!(out[[1, 2]], 5.0);
  }

  #[test]
  fn squeeze_batch_rejects_real_batches() {
    assert!(matches!(
      squeeze_batch(&[2, 3], vec![0.0; 6]),
      Err(FrameworkError::ShapeMismatch(_))
    ));
    assert!(matches!(
      squeeze_batch(&[], vec![]),
      Err(FrameworkError::ShapeMismatch(_))
    ));
  }

  #[test]
  fn artifact_paths_are_deterministic() {
    let base = Config::new(ModelVariant::YoloV4, BackendKind::Tf).weights_dir("/w");
    let cases = [
      (BackendKind::Tf, None, ArtifactPath::File("/w/yolov4.pb".into())),
      (
        BackendKind::TfLite,
        Some(QuantizationMode::Int8),
        ArtifactPath::File("/w/yolov4_int8.tflite".into()),
      ),
      (BackendKind::TfOnnx, None, ArtifactPath::File("/w/tf_yolov4.onnx".into())),
      (BackendKind::OnnxTf, None, ArtifactPath::Directory("/w/onnx_tf_yolov4".into())),
      (
        BackendKind::OnnxVino,
        None,
        ArtifactPath::Directory("/w/onnx_vino_yolov4".into()),
      ),
      (BackendKind::TorchOnnx, None, ArtifactPath::File("/w/yolov4.onnx".into())),
      (BackendKind::Torch, None, ArtifactPath::File("/w/yolov4.pt".into())),
    ];
    for (framework, quantize, expected) in cases {
      let config = Config {
        framework,
        quantize,
        ..base.clone()
      };
      assert_eq!(ArtifactPath::resolve(&config), expected);
    }
  }

  #[test]
  fn missing_artifact_is_reported_before_loading() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::new(ModelVariant::YoloV3, BackendKind::TfOnnx).weights_dir(dir.path());
    match Backend::new(&config) {
      Err(FrameworkError::ArtifactMissing(path)) => {
        assert_eq!(path, dir.path().join("tf_yolov3.onnx"))
      }
      Err(e) => panic!("unexpected error: {e}"),
      Ok(_) => panic!("backend should not load"),
    }
  }

  #[test]
  fn file_artifact_must_not_be_a_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("yolov3.pt")).unwrap();
    let artifact = ArtifactPath::File(dir.path().join("yolov3.pt"));
    assert!(matches!(
      artifact.ensure_exists(),
      Err(FrameworkError::ArtifactMissing(_))
    ));
    let artifact = ArtifactPath::Directory(dir.path().join("yolov3.pt"));
    assert!(artifact.ensure_exists().is_ok());
  }

  #[cfg(not(feature = "framework_torch"))]
  #[test]
  fn disabled_engine_is_not_compiled() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("yolov3.pt"), b"not a model").unwrap();
    let config = Config::new(ModelVariant::YoloV3, BackendKind::Torch).weights_dir(dir.path());
    assert!(matches!(
      Backend::new(&config),
      Err(FrameworkError::NotCompiled(BackendKind::Torch))
    ));
  }

  #[test]
  fn resolution_check_uses_given_axes() {
    assert!(check_resolution(BackendKind::TfOnnx, &[1, 3, 512, 512], (2, 3), 512).is_ok());
    assert!(check_resolution(BackendKind::TfLite, &[1, 512, 512, 3], (1, 2), 512).is_ok());
    assert!(matches!(
      check_resolution(BackendKind::TfLite, &[1, 416, 416, 3], (1, 2), 512),
      Err(FrameworkError::ShapeMismatch(_))
    ));
    assert!(check_resolution(BackendKind::TfOnnx, &[1, 3], (2, 3), 512).is_err());
  }

  #[test]
  fn input_feed_checks_name_and_type() {
    let feed = InputFeed {
      name: "images".to_string(),
      tensor: InputTensor::UInt8(Array4::zeros((1, 4, 4, 3))),
    };
    assert!(feed.expect_name("images").is_ok());
    assert!(matches!(
      feed.expect_name("x:0"),
      Err(FrameworkError::InputMismatch(_))
    ));
    assert!(feed.tensor.as_u8().is_ok());
    assert!(matches!(
      feed.tensor.as_f32(),
      Err(FrameworkError::InputMismatch(_))
    ));
    assert_eq!(feed.tensor.shape(), &[1, 4, 4, 3]);
  }

  #[test]
  fn integer_outputs_need_quant_params() {
    let params = Some(QuantParams {
      scale: 0.25,
      zero_point: -4,
    });
    assert_eq!(
      OutputData::I8(&[-4, 0, 4]).into_f32(params).unwrap(),
      vec![0.0, 1.0, 2.0]
    );
    assert_eq!(OutputData::U8(&[4]).into_f32(params).unwrap(), vec![2.0]);
    assert!(matches!(
      OutputData::U8(&[1, 2]).into_f32(None),
      Err(FrameworkError::ShapeMismatch(_))
    ));
    assert!(matches!(
      OutputData::I8(&[1]).into_f32(None),
      Err(FrameworkError::ShapeMismatch(_))
    ));
  }

  #[test]
  fn float_outputs_are_copied_unchanged() {
    let params = Some(QuantParams {
      scale: 0.5,
      zero_point: 10,
    });
    let raw = [0.5f32, -1.0, 3.25];
    assert_eq!(OutputData::F32(&raw).into_f32(None).unwrap(), raw.to_vec());
    assert_eq!(OutputData::F32(&raw).into_f32(params).unwrap(), raw.to_vec());
  }

  #[test]
  fn unknown_output_types_are_rejected() {
    for params in [None, Some(QuantParams { scale: 1.0, zero_point: 0 })] {
      assert!(matches!(
        OutputData::Unsupported("Int64".to_string()).into_f32(params),
        Err(FrameworkError::ShapeMismatch(msg)) if msg.contains("Int64")
      ));
    }
  }

  fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|n| n.to_string()).collect()
  }

  #[test]
  fn single_output_models_keep_only_output() {
    let declared = names(&["onnx::Sigmoid_1", "output", "aux"]);
    for kind in [BackendKind::TorchOnnx, BackendKind::OnnxVino] {
      assert_eq!(select_outputs(kind, &declared).unwrap(), names(&["output"]));
      assert!(matches!(
        select_outputs(kind, &names(&["Identity", "Identity_1"])),
        Err(FrameworkError::ShapeMismatch(_))
      ));
    }
  }

  #[test]
  fn saved_model_outputs_are_sorted() {
    let declared = names(&["output_2", "output_0", "output_1"]);
    assert_eq!(
      select_outputs(BackendKind::OnnxTf, &declared).unwrap(),
      names(&["output_0", "output_1", "output_2"])
    );
  }

  #[test]
  fn multi_output_models_keep_declared_order() {
    let declared = names(&["Identity_2:0", "Identity:0", "Identity_1:0"]);
    for kind in [BackendKind::TfOnnx, BackendKind::Tf, BackendKind::TfLite, BackendKind::Torch] {
      assert_eq!(select_outputs(kind, &declared).unwrap(), declared);
    }
  }

  #[test]
  fn models_without_outputs_are_rejected() {
    for kind in [BackendKind::TfOnnx, BackendKind::OnnxTf, BackendKind::TorchOnnx] {
      assert!(matches!(
        select_outputs(kind, &[]),
        Err(FrameworkError::ShapeMismatch(_))
      ));
    }
  }
}
