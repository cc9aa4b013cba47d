// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/preprocess.rs - 填充图像到输入张量
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

use ndarray::{ArrayView3, Axis, s};

use crate::{
  config::{BackendKind, InputPrecision},
  framework::InputTensor,
};

/// 输入张量的维度排布
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
  Nhwc,
  Nchw,
}

impl TensorLayout {
  pub fn for_backend(kind: BackendKind) -> Self {
    if kind.channel_first() {
      TensorLayout::Nchw
    } else {
      TensorLayout::Nhwc
    }
  }
}

/// `pad_image` 为 HWC、BGR 排布的填充图像
pub fn to_input_tensor(
  pad_image: ArrayView3<u8>,
  layout: TensorLayout,
  precision: InputPrecision,
) -> InputTensor {
  let rgb = pad_image.slice(s![.., .., ..;-1]);
  let arranged = match layout {
    TensorLayout::Nhwc => rgb,
    TensorLayout::Nchw => rgb.permuted_axes([2, 0, 1]),
  };
  let batched = arranged.insert_axis(Axis(0));

  match precision {
    InputPrecision::UInt8 => InputTensor::UInt8(batched.as_standard_layout().into_owned()),
    InputPrecision::Float32 => {
      let scaled = batched.mapv(|v| v as f32 / 255.0);
      InputTensor::Float32(scaled.as_standard_layout().into_owned())
    }
  }
}
