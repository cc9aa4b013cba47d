// 该文件是 Shanan （山南西风） 项目的一部分。
// src/framework/vino.rs - OpenVINO IR 推理框架
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
use openvino::{CompiledModel, Core, DeviceType, ElementType, Shape, Tensor};
use tracing::{debug, error};

use super::{
  ArtifactPath, Framework, FrameworkError, InputFeed, SINGLE_OUTPUT, check_resolution,
  select_outputs, squeeze_batch,
};
use crate::config::{BackendKind, Config};

const VINO_INPUT: &str = "images";

pub struct YoloVino {
  compiled: Mutex<CompiledModel>,
}

impl YoloVino {
  pub fn new(config: &Config, artifact: &ArtifactPath) -> Result<Self, FrameworkError> {
    let dir = artifact.path();
    let model = config.model.as_str();
    let xml = dir.join(format!("{model}.xml"));
    let bin = dir.join(format!("{model}.bin"));
    let (Some(xml_str), Some(bin_str)) = (xml.to_str(), bin.to_str()) else {
      return Err(FrameworkError::malformed(dir, "路径不是合法的 UTF-8"));
    };

    let mut core = Core::new().map_err(FrameworkError::engine)?;
    let network = core
      .read_model_from_file(xml_str, bin_str)
      .map_err(|e| FrameworkError::malformed(&xml, e))?;

    let inputs_len = network.get_inputs_len().map_err(FrameworkError::engine)?;
    let input = network.get_input_by_index(0).map_err(FrameworkError::engine)?;
    let input_name = input.get_name().map_err(FrameworkError::engine)?;
    if inputs_len != 1 || input_name != VINO_INPUT {
      error!("预期唯一输入 {}, 实际为 {} 个输入, 首个为 {}", VINO_INPUT, inputs_len, input_name);
      return Err(FrameworkError::ShapeMismatch(format!(
        "预期唯一输入 {VINO_INPUT}, 实际为 {inputs_len} 个输入"
      )));
    }
    let shape = input.get_shape().map_err(FrameworkError::engine)?;
    check_resolution(
      BackendKind::OnnxVino,
      shape.get_dimensions(),
      (2, 3),
      config.model.input_size(),
    )?;

    let outputs_len = network.get_outputs_len().map_err(FrameworkError::engine)?;
    let declared = (0..outputs_len)
      .map(|index| {
        network
          .get_output_by_index(index)
          .and_then(|o| o.get_name())
          .map_err(FrameworkError::engine)
      })
      .collect::<Result<Vec<_>, _>>()?;
    let selected = select_outputs(BackendKind::OnnxVino, &declared)?;
    debug!("模型输出: {:?}, 取回: {:?}", declared, selected);

    let compiled = core
      .compile_model(&network, DeviceType::CPU)
      .map_err(|e| FrameworkError::malformed(&xml, e))?;
    debug!("OpenVINO 模型已编译到 CPU");

    Ok(YoloVino {
      compiled: Mutex::new(compiled),
    })
  }
}

impl Framework for YoloVino {
  fn kind(&self) -> BackendKind {
    BackendKind::OnnxVino
  }

  fn input_name(&self) -> &str {
    VINO_INPUT
  }

  fn inference(&self, feed: &InputFeed) -> Result<Vec<ArrayD<f32>>, FrameworkError> {
    feed.expect_name(VINO_INPUT)?;
    let input = feed.tensor.as_f32()?;
    let data = input
      .as_slice()
      .ok_or_else(|| FrameworkError::InputMismatch("输入张量不连续".to_string()))?;
    let dims: Vec<i64> = input.shape().iter().map(|&d| d as i64).collect();

    let shape = Shape::new(&dims).map_err(FrameworkError::engine)?;
    let mut tensor = Tensor::new(ElementType::F32, &shape).map_err(FrameworkError::engine)?;
    tensor
      .get_data_mut::<f32>()
      .map_err(FrameworkError::engine)?
      .copy_from_slice(data);

    let mut compiled = self.compiled.lock().map_err(|_| FrameworkError::poisoned())?;
    let mut request = compiled.create_infer_request().map_err(FrameworkError::engine)?;
    request
      .set_tensor(VINO_INPUT, &tensor)
      .map_err(FrameworkError::engine)?;
    request.infer().map_err(FrameworkError::engine)?;

    let output = request.get_tensor(SINGLE_OUTPUT).map_err(FrameworkError::engine)?;
    let dims: Vec<usize> = output
      .get_shape()
      .map_err(FrameworkError::engine)?
      .get_dimensions()
      .iter()
      .map(|&d| d as usize)
      .collect();
    let data = output.get_data::<f32>().map_err(FrameworkError::engine)?.to_vec();
    Ok(vec![squeeze_batch(&dims, data)?])
  }
}
