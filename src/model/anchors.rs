// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/anchors.rs - 各版本 YOLO 的锚框与网格缩放表
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

use crate::config::ModelVariant;

pub const ANCHORS_PER_STRIDE: usize = 3;

/// 一个检测头（步长）上的先验框与中心点缩放系数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrideAnchors {
  pub stride: usize,
  /// (宽, 高)，单位为输入图像像素
  pub anchors: [(f64, f64); ANCHORS_PER_STRIDE],
  /// 网格敏感度校正系数，1.0 表示不校正
  pub xyscale: f64,
}

static YOLOV3_TINY: [StrideAnchors; 2] = [
  StrideAnchors {
    stride: 16,
    anchors: [(10.0, 14.0), (23.0, 27.0), (37.0, 58.0)],
    xyscale: 1.0,
  },
  StrideAnchors {
    stride: 32,
    anchors: [(81.0, 82.0), (135.0, 169.0), (344.0, 319.0)],
    xyscale: 1.0,
  },
];

static YOLOV3: [StrideAnchors; 3] = [
  StrideAnchors {
    stride: 8,
    anchors: [(10.0, 13.0), (16.0, 30.0), (33.0, 23.0)],
    xyscale: 1.0,
  },
  StrideAnchors {
    stride: 16,
    anchors: [(30.0, 61.0), (62.0, 45.0), (59.0, 119.0)],
    xyscale: 1.0,
  },
  StrideAnchors {
    stride: 32,
    anchors: [(116.0, 90.0), (156.0, 198.0), (373.0, 326.0)],
    xyscale: 1.0,
  },
];

static YOLOV4: [StrideAnchors; 3] = [
  StrideAnchors {
    stride: 8,
    anchors: [(12.0, 16.0), (19.0, 36.0), (40.0, 28.0)],
    xyscale: 1.05,
  },
  StrideAnchors {
    stride: 16,
    anchors: [(36.0, 75.0), (76.0, 55.0), (72.0, 146.0)],
    xyscale: 1.1,
  },
  StrideAnchors {
    stride: 32,
    anchors: [(142.0, 110.0), (192.0, 243.0), (459.0, 401.0)],
    xyscale: 1.2,
  },
];

pub fn stride_table(model: ModelVariant) -> &'static [StrideAnchors] {
  match model {
    ModelVariant::YoloV3Tiny => &YOLOV3_TINY,
    ModelVariant::YoloV3 => &YOLOV3,
    ModelVariant::YoloV4 => &YOLOV4,
  }
}

pub fn lookup(model: ModelVariant, stride: usize) -> Option<&'static StrideAnchors> {
  stride_table(model).iter().find(|s| s.stride == stride)
}
