// 该文件是 Shanan （山南西风） 项目的一部分。
// src/framework/onnx.rs - ONNX Runtime 推理框架
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
use ort::{
  session::Session,
  value::{Tensor, ValueType},
};
use tracing::{debug, error};

use super::{
  ArtifactPath, Framework, FrameworkError, InputFeed, check_resolution, select_outputs,
  squeeze_batch,
};
use crate::config::{BackendKind, Config};

const TF_ONNX_INPUT: &str = "x:0";
const TORCH_ONNX_INPUT: &str = "images";

/// ONNX 模型，`tf_onnx` 与 `torch_onnx` 共用
pub struct YoloOnnx {
  kind: BackendKind,
  session: Mutex<Session>,
  input_name: String,
  output_names: Vec<String>,
}

impl YoloOnnx {
  pub fn new(config: &Config, artifact: &ArtifactPath) -> Result<Self, FrameworkError> {
    let path = artifact.path();
    let session = Session::builder()
      .and_then(|builder| builder.commit_from_file(path))
      .map_err(|e| FrameworkError::malformed(path, e))?;

    let expected_input = match config.framework {
      BackendKind::TfOnnx => TF_ONNX_INPUT,
      _ => TORCH_ONNX_INPUT,
    };
    let input_names: Vec<&str> = session.inputs.iter().map(|i| i.name.as_str()).collect();
    if input_names != [expected_input] {
      error!("预期唯一输入 {}, 实际为 {:?}", expected_input, input_names);
      return Err(FrameworkError::ShapeMismatch(format!(
        "预期唯一输入 {expected_input}, 实际为 {input_names:?}"
      )));
    }

    let dims: Vec<i64> = match &session.inputs[0].input_type {
      ValueType::Tensor { shape, .. } => shape.iter().copied().collect(),
      other => {
        return Err(FrameworkError::ShapeMismatch(format!(
          "输入 {expected_input} 不是张量: {other:?}"
        )));
      }
    };
    check_resolution(config.framework, &dims, (2, 3), config.model.input_size())?;

    let declared: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
    let output_names = select_outputs(config.framework, &declared)?;
    debug!("模型输入: {}, 输出: {:?}", expected_input, output_names);

    Ok(YoloOnnx {
      kind: config.framework,
      session: Mutex::new(session),
      input_name: expected_input.to_string(),
      output_names,
    })
  }
}

impl Framework for YoloOnnx {
  fn kind(&self) -> BackendKind {
    self.kind
  }

  fn input_name(&self) -> &str {
    &self.input_name
  }

  fn inference(&self, feed: &InputFeed) -> Result<Vec<ArrayD<f32>>, FrameworkError> {
    feed.expect_name(&self.input_name)?;
    let input = feed.tensor.as_f32()?;
    let value = Tensor::from_array((input.shape().to_vec(), input.iter().copied().collect::<Vec<f32>>()))
      .map_err(FrameworkError::engine)?;

    let mut session = self.session.lock().map_err(|_| FrameworkError::poisoned())?;
    let outputs = session
      .run(ort::inputs![self.input_name.as_str() => value])
      .map_err(FrameworkError::engine)?;

    let mut preds = Vec::with_capacity(self.output_names.len());
    for name in &self.output_names {
      let (shape, data) = outputs[name.as_str()]
        .try_extract_tensor::<f32>()
        .map_err(FrameworkError::engine)?;
      let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
      preds.push(squeeze_batch(&dims, data.to_vec())?);
    }
    Ok(preds)
  }
}
