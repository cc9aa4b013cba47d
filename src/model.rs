// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 模型定义
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

use ndarray::Array2;
use serde::Serialize;

use self::{decode::DecodeError, postprocess::DETECTION_COLUMNS};

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectItem {
  pub class_id: u32,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectResult {
  pub items: Box<[DetectItem]>,
}

impl DetectResult {
  /// 由检测矩阵（每行 x_min, y_min, x_max, y_max, category_id, confidence）构造，
  /// 行序不变；列数不为 6 时返回错误
  pub fn from_matrix(detections: &Array2<f64>) -> Result<Self, DecodeError> {
    if detections.ncols() != DETECTION_COLUMNS {
      return Err(DecodeError::ColumnMismatch {
        expected: DETECTION_COLUMNS,
        found: detections.ncols(),
      });
    }
    let items = detections
      .outer_iter()
      .map(|row| DetectItem {
        class_id: row[4] as u32,
        score: row[5] as f32,
        bbox: [row[0] as f32, row[1] as f32, row[2] as f32, row[3] as f32],
      })
      .collect();
    Ok(DetectResult { items })
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }
}

pub mod anchors;
pub mod decode;
pub mod labels;
pub mod postprocess;
pub mod preprocess;

mod yolo;
pub use self::yolo::{Yolo, YoloError};
