// 该文件是 Shanan （山南西风） 项目的一部分。
// src/framework/torch.rs - TorchScript 推理框架
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
use tch::{CModule, Device, IValue, Kind, Tensor};
use tracing::debug;

use super::{ArtifactPath, Framework, FrameworkError, InputFeed, check_resolution, squeeze_batch};
use crate::config::{BackendKind, Config};

const TORCH_INPUT: &str = "images";

/// TorchScript 模块不携带输入形状，分辨率在每次推理时检查
pub struct YoloTorch {
  module: Mutex<CModule>,
  input_size: usize,
}

impl YoloTorch {
  pub fn new(config: &Config, artifact: &ArtifactPath) -> Result<Self, FrameworkError> {
    let path = artifact.path();
    let mut module =
      CModule::load_on_device(path, Device::Cpu).map_err(|e| FrameworkError::malformed(path, e))?;
    module.set_eval();
    debug!("TorchScript 模块已加载到 CPU");

    Ok(YoloTorch {
      module: Mutex::new(module),
      input_size: config.model.input_size(),
    })
  }
}

fn first_tensor(value: IValue) -> Option<Tensor> {
  match value {
    IValue::Tensor(t) => Some(t),
    IValue::Tuple(items) | IValue::GenericList(items) => items.into_iter().find_map(first_tensor),
    IValue::TensorList(mut items) if !items.is_empty() => Some(items.swap_remove(0)),
    _ => None,
  }
}

impl Framework for YoloTorch {
  fn kind(&self) -> BackendKind {
    BackendKind::Torch
  }

  fn input_name(&self) -> &str {
    TORCH_INPUT
  }

  fn inference(&self, feed: &InputFeed) -> Result<Vec<ArrayD<f32>>, FrameworkError> {
    feed.expect_name(TORCH_INPUT)?;
    let input = feed.tensor.as_f32()?;
    let dims: Vec<i64> = input.shape().iter().map(|&d| d as i64).collect();
    check_resolution(BackendKind::Torch, &dims, (2, 3), self.input_size)?;

    let data = input
      .as_slice()
      .ok_or_else(|| FrameworkError::InputMismatch("输入张量不连续".to_string()))?;
    let tensor = Tensor::from_slice(data).view(dims.as_slice());

    let module = self.module.lock().map_err(|_| FrameworkError::poisoned())?;
    let output = tch::no_grad(|| module.forward_is(&[IValue::Tensor(tensor)]))
      .map_err(FrameworkError::engine)?;
    let output = first_tensor(output)
      .ok_or_else(|| FrameworkError::ShapeMismatch("模型输出中没有张量".to_string()))?
      .to_device(Device::Cpu)
      .to_kind(Kind::Float);

    let dims: Vec<usize> = output.size().iter().map(|&d| d as usize).collect();
    let data = Vec::<f32>::try_from(output.flatten(0, -1)).map_err(FrameworkError::engine)?;
    Ok(vec![squeeze_batch(&dims, data)?])
  }
}
