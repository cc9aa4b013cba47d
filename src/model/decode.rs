// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/decode.rs - 按步长解码锚框
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

use ndarray::{Array2, ArrayD, Order};
use thiserror::Error;
use tracing::{debug, error};

use super::anchors::{self, ANCHORS_PER_STRIDE};
use crate::config::ModelVariant;

/// exp(-x) 在 f64 下不会溢出、且 sigmoid 不会取到 0 或 1 的范围
pub const SIGMOID_RANGE: f64 = 34.538776394910684;

#[derive(Error, Debug)]
pub enum DecodeError {
  #[error("特征图 {index} 的网格大小 {grid} 无法整除输入尺寸 {input_size}")]
  InvalidGrid {
    index: usize,
    grid: usize,
    input_size: usize,
  },
  #[error("模型 {model} 没有步长 {stride} 的锚框")]
  UnknownStride { model: ModelVariant, stride: usize },
  #[error("特征图 {index} 通道数不匹配: 期望 {expected}, 实际 {found} 个元素")]
  ChannelMismatch {
    index: usize,
    expected: usize,
    found: usize,
  },
  #[error("矩阵列数不匹配: 期望 {expected}, 实际 {found}")]
  ColumnMismatch { expected: usize, found: usize },
  #[error("输出步长 {found:?} 与模型 {model} 的步长 {expected:?} 不一致")]
  StrideSetMismatch {
    model: ModelVariant,
    expected: Vec<usize>,
    found: Vec<usize>,
  },
}

pub fn sigmoid(x: f64) -> f64 {
  let x = x.clamp(-SIGMOID_RANGE, SIGMOID_RANGE);
  1.0 / (1.0 + (-x).exp())
}

/// 网格敏感度校正，xyscale 为 1.0 时原样返回
pub fn scale_xy(s: f64, xyscale: f64) -> f64 {
  s * xyscale - 0.5 * (xyscale - 1.0)
}

/// 将每个步长的原始特征图解码为 (cx, cy, w, h, objectness, 类别概率...) 行，
/// 坐标为填充后输入图像上的像素
pub fn apply_anchors(model: ModelVariant, preds: &[ArrayD<f32>]) -> Result<Array2<f64>, DecodeError> {
  let input_size = model.input_size();
  let depth = model.num_channels();

  let mut heads = Vec::with_capacity(preds.len());
  for (index, pred) in preds.iter().enumerate() {
    let grid = pred.shape().first().copied().unwrap_or(0);
    if grid == 0 || input_size % grid != 0 {
      error!("特征图 {} 形状 {:?} 无效", index, pred.shape());
      return Err(DecodeError::InvalidGrid {
        index,
        grid,
        input_size,
      });
    }
    let stride = input_size / grid;
    let table = anchors::lookup(model, stride).ok_or(DecodeError::UnknownStride { model, stride })?;

    let boxes = grid * grid * ANCHORS_PER_STRIDE;
    let mismatch = || DecodeError::ChannelMismatch {
      index,
      expected: depth,
      found: pred.len() / boxes,
    };
    if pred.len() != boxes * depth {
      error!("特征图 {} 形状 {:?} 与通道数 {} 不符", index, pred.shape(), depth);
      return Err(mismatch());
    }
    let raw = pred
      .to_shape(((boxes, depth), Order::RowMajor))
      .map_err(|_| mismatch())?;
    debug!("特征图 {}: 网格 {}x{}, 步长 {}", index, grid, grid, stride);
    heads.push((raw, grid, table));
  }

  let mut expected: Vec<usize> = anchors::stride_table(model).iter().map(|s| s.stride).collect();
  expected.sort_unstable();
  let mut found: Vec<usize> = heads.iter().map(|(_, _, table)| table.stride).collect();
  found.sort_unstable();
  if expected != found {
    error!("输出步长 {:?} 与模型 {} 的步长 {:?} 不一致", found, model, expected);
    return Err(DecodeError::StrideSetMismatch {
      model,
      expected,
      found,
    });
  }

  let total = heads.iter().map(|(raw, _, _)| raw.nrows()).sum();
  let mut decoded = Array2::<f64>::zeros((total, depth));
  let mut out_rows = decoded.outer_iter_mut();
  for (raw, grid, table) in &heads {
    let stride = table.stride as f64;
    for ((i, row), mut out) in raw.outer_iter().enumerate().zip(out_rows.by_ref()) {
      let cell = i / ANCHORS_PER_STRIDE;
      let (anchor_w, anchor_h) = table.anchors[i % ANCHORS_PER_STRIDE];
      let col = (cell % grid) as f64;
      let line = (cell / grid) as f64;

      out[0] = (scale_xy(sigmoid(row[0] as f64), table.xyscale) + col) * stride;
      out[1] = (scale_xy(sigmoid(row[1] as f64), table.xyscale) + line) * stride;
      out[2] = (row[2] as f64).exp() * anchor_w;
      out[3] = (row[3] as f64).exp() * anchor_h;
      for (dst, &src) in out.iter_mut().zip(row.iter()).skip(4) {
        *dst = sigmoid(src as f64);
      }
    }
  }

  Ok(decoded)
}
