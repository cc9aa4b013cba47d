// 该文件是 Shanan （山南西风） 项目的一部分。
// src/config.rs - 模型与推理框架配置
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

use std::{fmt, path::PathBuf, str::FromStr};

use thiserror::Error;
use tracing::{error, warn};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme};

const YOLO_SCHEME: &str = "yolo";
const DEFAULT_WEIGHTS_DIR: &str = "weights/yolo";

const YOLO_INPUT_SIZE: usize = 512;
const YOLO_CLASS_NUM: usize = 80;
const YOLO_TINY_CONFIDENCE_POWER: f64 = 0.3;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("URI 方案不匹配: 期望 {expected}, 实际为 {found}")]
  SchemeMismatch {
    expected: &'static str,
    found: String,
  },
  #[error("YOLO 不支持模型: {0}")]
  UnsupportedModel(String),
  #[error("YOLO 不支持推理框架: {0}")]
  UnsupportedFramework(String),
  #[error("不支持的量化模式: {0}")]
  UnsupportedQuantize(String),
  #[error("缺少参数: {0}")]
  MissingParameter(&'static str),
}

/// YOLO 模型版本
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelVariant {
  YoloV3Tiny,
  YoloV3,
  YoloV4,
}

impl ModelVariant {
  pub fn as_str(&self) -> &'static str {
    match self {
      ModelVariant::YoloV3Tiny => "yolov3-tiny",
      ModelVariant::YoloV3 => "yolov3",
      ModelVariant::YoloV4 => "yolov4",
    }
  }

  /// 模型输入的边长（输入为正方形）
  pub fn input_size(&self) -> usize {
    YOLO_INPUT_SIZE
  }

  pub fn num_classes(&self) -> usize {
    YOLO_CLASS_NUM
  }

  /// 每个锚框的通道数: x, y, w, h, objectness + 各类别概率
  pub fn num_channels(&self) -> usize {
    5 + self.num_classes()
  }

  /// 类别置信度的经验校正指数，只有 yolov3-tiny 需要
  pub fn confidence_power(&self) -> Option<f64> {
    match self {
      ModelVariant::YoloV3Tiny => Some(YOLO_TINY_CONFIDENCE_POWER),
      ModelVariant::YoloV3 | ModelVariant::YoloV4 => None,
    }
  }
}

impl fmt::Display for ModelVariant {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ModelVariant {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "yolov3-tiny" => Ok(ModelVariant::YoloV3Tiny),
      "yolov3" => Ok(ModelVariant::YoloV3),
      "yolov4" => Ok(ModelVariant::YoloV4),
      other => Err(ConfigError::UnsupportedModel(other.to_string())),
    }
  }
}

/// 推理框架（执行引擎）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
  /// TensorFlow 冻结图
  Tf,
  /// TensorFlow Lite
  TfLite,
  /// 由 TensorFlow 导出的 ONNX
  TfOnnx,
  /// 由 ONNX 转换得到的 TensorFlow SavedModel
  OnnxTf,
  /// OpenVINO IR
  OnnxVino,
  /// 由 PyTorch 导出的 ONNX
  TorchOnnx,
  /// TorchScript
  Torch,
}

impl BackendKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      BackendKind::Tf => "tf",
      BackendKind::TfLite => "tflite",
      BackendKind::TfOnnx => "tf_onnx",
      BackendKind::OnnxTf => "onnx_tf",
      BackendKind::OnnxVino => "onnx_vino",
      BackendKind::TorchOnnx => "torch_onnx",
      BackendKind::Torch => "torch",
    }
  }

  /// 该框架的模型是否以 NCHW 排布接收输入
  pub fn channel_first(&self) -> bool {
    matches!(
      self,
      BackendKind::Torch
        | BackendKind::TorchOnnx
        | BackendKind::OnnxVino
        | BackendKind::OnnxTf
        | BackendKind::TfOnnx
    )
  }
}

impl fmt::Display for BackendKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for BackendKind {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "tf" => Ok(BackendKind::Tf),
      "tflite" => Ok(BackendKind::TfLite),
      "tf_onnx" => Ok(BackendKind::TfOnnx),
      "onnx_tf" => Ok(BackendKind::OnnxTf),
      "onnx_vino" => Ok(BackendKind::OnnxVino),
      "torch_onnx" => Ok(BackendKind::TorchOnnx),
      "torch" => Ok(BackendKind::Torch),
      other => Err(ConfigError::UnsupportedFramework(other.to_string())),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuantizationMode {
  Fp32,
  Fp16,
  Int8,
}

impl QuantizationMode {
  pub fn as_str(&self) -> &'static str {
    match self {
      QuantizationMode::Fp32 => "fp32",
      QuantizationMode::Fp16 => "fp16",
      QuantizationMode::Int8 => "int8",
    }
  }
}

impl fmt::Display for QuantizationMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for QuantizationMode {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "fp32" => Ok(QuantizationMode::Fp32),
      "fp16" => Ok(QuantizationMode::Fp16),
      "int8" => Ok(QuantizationMode::Int8),
      other => Err(ConfigError::UnsupportedQuantize(other.to_string())),
    }
  }
}

/// 输入张量的数值类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputPrecision {
  /// 归一化到 [0, 1] 的 f32
  Float32,
  /// 原始像素值
  UInt8,
}

/// 检测器配置
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
  pub model: ModelVariant,
  pub framework: BackendKind,
  pub quantize: Option<QuantizationMode>,
  pub weights_dir: PathBuf,
}

impl Config {
  pub fn new(model: ModelVariant, framework: BackendKind) -> Self {
    Config {
      model,
      framework,
      quantize: None,
      weights_dir: PathBuf::from(DEFAULT_WEIGHTS_DIR),
    }
  }

  pub fn quantize(mut self, quantize: QuantizationMode) -> Self {
    self.quantize = Some(quantize);
    self
  }

  pub fn weights_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.weights_dir = dir.into();
    self
  }

  /// 只有 int8 的 TFLite 模型直接接收 u8 像素
  pub fn input_precision(&self) -> InputPrecision {
    match (self.framework, self.quantize) {
      (BackendKind::TfLite, Some(QuantizationMode::Int8)) => InputPrecision::UInt8,
      _ => InputPrecision::Float32,
    }
  }

  fn validate(self) -> Result<Self, ConfigError> {
    match (self.framework, self.quantize) {
      (BackendKind::TfLite, None) => {
        error!("TFLite 模型需要指定量化模式");
        Err(ConfigError::MissingParameter("quantize"))
      }
      (BackendKind::TfLite, Some(_)) | (_, None) => Ok(self),
      (framework, Some(quantize)) => {
        warn!("量化模式 {} 仅对 tflite 有效, {} 将忽略该参数", quantize, framework);
        Ok(Config {
          quantize: None,
          ..self
        })
      }
    }
  }
}

impl FromUrl for Config {
  type Error = ConfigError;

  /// 例如 `yolo:///opt/weights/yolo?model=yolov4&framework=tflite&quantize=int8`,
  /// 路径为空时使用默认权重目录
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != YOLO_SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际为 '{}'",
        YOLO_SCHEME,
        url.scheme()
      );
      return Err(ConfigError::SchemeMismatch {
        expected: YOLO_SCHEME,
        found: url.scheme().to_string(),
      });
    }

    let mut model = None;
    let mut framework = None;
    let mut quantize = None;
    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "model" => model = Some(value.parse::<ModelVariant>()?),
        "framework" => framework = Some(value.parse::<BackendKind>()?),
        "quantize" => quantize = Some(value.parse::<QuantizationMode>()?),
        other => warn!("忽略未知参数: {}", other),
      }
    }

    let model = model.ok_or(ConfigError::MissingParameter("model"))?;
    let framework = framework.ok_or(ConfigError::MissingParameter("framework"))?;

    let mut config = Config::new(model, framework);
    config.quantize = quantize;
    let path = url.path();
    if !path.is_empty() && path != "/" {
      config.weights_dir = PathBuf::from(path);
    }

    config.validate()
  }
}

impl FromUrlWithScheme for Config {
  const SCHEME: &'static str = YOLO_SCHEME;
}

#[cfg(test)]
mod tests {
  use super::*;

  fn parse(s: &str) -> Result<Config, ConfigError> {
    Config::from_url(&Url::parse(s).unwrap())
  }

  #[test]
  fn parses_full_url() {
    let config = parse("yolo:///opt/weights?model=yolov4&framework=tflite&quantize=int8").unwrap();
    assert_eq!(config.model, ModelVariant::YoloV4);
    assert_eq!(config.framework, BackendKind::TfLite);
    assert_eq!(config.quantize, Some(QuantizationMode::Int8));
    assert_eq!(config.weights_dir, PathBuf::from("/opt/weights"));
    assert_eq!(config.input_precision(), InputPrecision::UInt8);
  }

  #[test]
  fn empty_path_uses_default_weights_dir() {
    let config = parse("yolo:///?model=yolov3&framework=tf_onnx").unwrap();
    assert_eq!(config.weights_dir, PathBuf::from(DEFAULT_WEIGHTS_DIR));
    assert_eq!(config.input_precision(), InputPrecision::Float32);
  }

  #[test]
  fn unknown_identifiers_are_rejected() {
    assert!(matches!(
      parse("yolo:///?model=yolov9&framework=tf"),
      Err(ConfigError::UnsupportedModel(m)) if m == "yolov9"
    ));
    assert!(matches!(
      parse("yolo:///?model=yolov3&framework=caffe"),
      Err(ConfigError::UnsupportedFramework(f)) if f == "caffe"
    ));
    assert!(matches!(
      parse("yolo:///?model=yolov3&framework=tflite&quantize=int4"),
      Err(ConfigError::UnsupportedQuantize(_))
    ));
    assert!(matches!(
      parse("image:///?model=yolov3&framework=tf"),
      Err(ConfigError::SchemeMismatch { .. })
    ));
  }

  #[test]
  fn tflite_requires_quantize() {
    assert!(matches!(
      parse("yolo:///?model=yolov3&framework=tflite"),
      Err(ConfigError::MissingParameter("quantize"))
    ));
  }

  #[test]
  fn quantize_is_dropped_outside_tflite() {
    let config = parse("yolo:///?model=yolov3&framework=onnx_vino&quantize=int8").unwrap();
    assert_eq!(config.quantize, None);
    assert_eq!(config.input_precision(), InputPrecision::Float32);
  }

  #[test]
  fn identifiers_round_trip_through_display() {
    for kind in [
      BackendKind::Tf,
      BackendKind::TfLite,
      BackendKind::TfOnnx,
      BackendKind::OnnxTf,
      BackendKind::OnnxVino,
      BackendKind::TorchOnnx,
      BackendKind::Torch,
    ] {
      assert_eq!(kind.to_string().parse::<BackendKind>().unwrap(), kind);
    }
    for model in [ModelVariant::YoloV3Tiny, ModelVariant::YoloV3, ModelVariant::YoloV4] {
      assert_eq!(model.to_string().parse::<ModelVariant>().unwrap(), model);
    }
  }

  #[test]
  fn only_tiny_has_confidence_power() {
    assert_eq!(ModelVariant::YoloV3Tiny.confidence_power(), Some(0.3));
    assert_eq!(ModelVariant::YoloV3.confidence_power(), None);
    assert_eq!(ModelVariant::YoloV4.confidence_power(), None);
  }
}
