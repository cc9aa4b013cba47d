// 该文件是 Shanan （山南西风） 项目的一部分。
// src/framework/tflite.rs - TensorFlow Lite 推理框架
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

use std::sync::Mutex;

use ndarray::ArrayD;
use tflitec::{
  interpreter::{Interpreter, Options},
  model::Model,
  tensor::DataType,
};
use tracing::debug;

use super::{
  ArtifactPath, Framework, FrameworkError, InputFeed, OutputData, QuantParams, check_resolution,
  squeeze_batch,
};
use crate::config::{BackendKind, Config, QuantizationMode};

const TFLITE_INPUT: &str = "images";

pub struct YoloTfLite {
  interpreter: Mutex<Interpreter<'static>>,
  quantized: bool,
  output_quant: Vec<Option<QuantParams>>,
}

impl YoloTfLite {
  pub fn new(config: &Config, artifact: &ArtifactPath) -> Result<Self, FrameworkError> {
    let path = artifact.path();
    let path_str = path
      .to_str()
      .ok_or_else(|| FrameworkError::malformed(path, "路径不是合法的 UTF-8"))?;
    let model = Model::new(path_str).map_err(|e| FrameworkError::malformed(path, e))?;
    // 解释器借用模型，模型随进程常驻
    let model: &'static Model<'static> = Box::leak(Box::new(model));

    let interpreter =
      Interpreter::new(model, Some(Options::default())).map_err(|e| FrameworkError::malformed(path, e))?;
    interpreter
      .allocate_tensors()
      .map_err(|e| FrameworkError::malformed(path, e))?;

    if interpreter.input_tensor_count() != 1 {
      return Err(FrameworkError::ShapeMismatch(format!(
        "预期 1 个输入, 实际为 {}",
        interpreter.input_tensor_count()
      )));
    }
    let input = interpreter.input(0).map_err(FrameworkError::engine)?;
    let dims: Vec<i64> = input.shape().dimensions().iter().map(|&d| d as i64).collect();
    check_resolution(BackendKind::TfLite, &dims, (1, 2), config.model.input_size())?;

    let quantized = config.quantize == Some(QuantizationMode::Int8);
    let mut output_quant = Vec::with_capacity(interpreter.output_tensor_count());
    for index in 0..interpreter.output_tensor_count() {
      let output = interpreter.output(index).map_err(FrameworkError::engine)?;
      // 仅整数输出需要量化参数，缺失时在推理阶段报错
      let params = if quantized {
        output.quantization_parameters().map(|params| QuantParams {
          scale: params.scale,
          zero_point: params.zero_point,
        })
      } else {
        None
      };
      debug!("输出 {}: 形状 {:?}, 量化参数 {:?}", index, output.shape().dimensions(), params);
      output_quant.push(params);
    }

    Ok(YoloTfLite {
      interpreter: Mutex::new(interpreter),
      quantized,
      output_quant,
    })
  }
}

impl Framework for YoloTfLite {
  fn kind(&self) -> BackendKind {
    BackendKind::TfLite
  }

  fn input_name(&self) -> &str {
    TFLITE_INPUT
  }

  fn inference(&self, feed: &InputFeed) -> Result<Vec<ArrayD<f32>>, FrameworkError> {
    feed.expect_name(TFLITE_INPUT)?;
    let interpreter = self.interpreter.lock().map_err(|_| FrameworkError::poisoned())?;

    if self.quantized {
      let input = feed.tensor.as_u8()?;
      let data = input
        .as_slice()
        .ok_or_else(|| FrameworkError::InputMismatch("输入张量不连续".to_string()))?;
      interpreter.copy(data, 0).map_err(FrameworkError::engine)?;
    } else {
      let input = feed.tensor.as_f32()?;
      let data = input
        .as_slice()
        .ok_or_else(|| FrameworkError::InputMismatch("输入张量不连续".to_string()))?;
      interpreter.copy(data, 0).map_err(FrameworkError::engine)?;
    }

    interpreter.invoke().map_err(FrameworkError::engine)?;

    let mut preds = Vec::with_capacity(self.output_quant.len());
    for (index, params) in self.output_quant.iter().enumerate() {
      let output = interpreter.output(index).map_err(FrameworkError::engine)?;
      let dims = output.shape().dimensions().clone();
      let raw = match output.data_type() {
        DataType::Float32 => OutputData::F32(output.data::<f32>()),
        DataType::Uint8 => OutputData::U8(output.data::<u8>()),
        DataType::Int8 => OutputData::I8(output.data::<i8>()),
        other => OutputData::Unsupported(format!("{other:?}")),
      };
      let data = raw.into_f32(*params)?;
      preds.push(squeeze_batch(&dims, data)?);
    }
    Ok(preds)
  }
}
