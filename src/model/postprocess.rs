// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/postprocess.rs - 解码结果到检测矩阵
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

use ndarray::{Array2, ArrayView1, s};
use tracing::{debug, error};

use super::decode::DecodeError;
use crate::{config::ModelVariant, session::Letterbox};

/// 检测矩阵的列数: x_min, y_min, x_max, y_max, category_id, confidence
pub const DETECTION_COLUMNS: usize = 6;

pub fn xywh_to_xyxy(cx: f64, cy: f64, w: f64, h: f64) -> [f64; 4] {
  [cx - w * 0.5, cy - h * 0.5, cx + w * 0.5, cy + h * 0.5]
}

/// 返回置信度最高的类别（并列时取第一个）及其置信度。
/// 遇到 NaN 时返回第一个 NaN 所在的类别与 NaN，没有类别时返回 None
pub fn category_confidence(
  objectness: f64,
  probs: ArrayView1<f64>,
  confidence_power: Option<f64>,
) -> Option<(usize, f64)> {
  let mut best: Option<(usize, f64)> = None;
  for (i, &p) in probs.iter().enumerate() {
    let mut conf = objectness * p;
    if let Some(power) = confidence_power {
      conf = conf.powf(power);
    }
    if conf.is_nan() {
      return Some((i, conf));
    }
    if best.is_none_or(|(_, top)| conf > top) {
      best = Some((i, conf));
    }
  }
  best
}

/// 每个解码框输出一行，不做阈值过滤与非极大值抑制
pub fn finalize(
  model: ModelVariant,
  decoded: &Array2<f64>,
  letterbox: &Letterbox,
) -> Result<Array2<f64>, DecodeError> {
  let width_mismatch = || DecodeError::ColumnMismatch {
    expected: model.num_channels(),
    found: decoded.ncols(),
  };
  if decoded.ncols() != model.num_channels() {
    error!(
      "解码结果列数 {} 与模型 {} 的通道数 {} 不符",
      decoded.ncols(),
      model,
      model.num_channels()
    );
    return Err(width_mismatch());
  }

  let confidence_power = model.confidence_power();
  let mut detections = Array2::zeros((decoded.nrows(), DETECTION_COLUMNS));
  for (src, mut dst) in decoded.outer_iter().zip(detections.outer_iter_mut()) {
    let xyxy = letterbox.rescale_xyxy(xywh_to_xyxy(src[0], src[1], src[2], src[3]));
    let (category, confidence) =
      category_confidence(src[4], src.slice(s![5..]), confidence_power).ok_or_else(width_mismatch)?;

    dst[0] = xyxy[0];
    dst[1] = xyxy[1];
    dst[2] = xyxy[2];
    dst[3] = xyxy[3];
    dst[4] = category as f64;
    dst[5] = confidence;
  }
  debug!("后处理完成, 共 {} 个候选框", detections.nrows());
  Ok(detections)
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_abs_diff_eq;
  use ndarray::{Array1, array};

  fn xyxy_to_xywh(b: [f64; 4]) -> [f64; 4] {
    [(b[0] + b[2]) * 0.5, (b[1] + b[3]) * 0.5, b[2] - b[0], b[3] - b[1]]
  }

  #[test]
  fn corner_form_inverts_center_form() {
    let boxes = [
      [10.0, 20.0, 30.0, 60.0],
      [0.0, 0.0, 512.0, 512.0],
      [-5.5, 3.25, 7.0, 9.0],
    ];
    for b in boxes {
      let [cx, cy, w, h] = xyxy_to_xywh(b);
      let back = xywh_to_xyxy(cx, cy, w, h);
      for k in 0..4 {
        assert_abs_diff_eq!(back[k], b[k], epsilon = 1e-9);
      }
    }
  }

  #[test]
  fn first_argmax_wins_ties() {
    let probs = array![0.2, 0.8, 0.8, 0.1];
    let (cat, conf) = category_confidence(0.5, probs.view(), None).unwrap();
    assert_eq!(cat, 1);
    assert_abs_diff_eq!(conf, 0.4);

    let empty = Array1::<f64>::zeros(0);
    assert_eq!(category_confidence(0.9, empty.view(), None), None);
  }

  #[test]
  fn nan_class_wins_like_argmax() {
    let probs = array![0.2, f64::NAN, 0.1, f64::NAN];
    let (cat, conf) = category_confidence(0.9, probs.view(), None).unwrap();
    assert_eq!(cat, 1);
    assert!(conf.is_nan());

    let (cat, conf) = category_confidence(f64::NAN, array![0.2, 0.3].view(), None).unwrap();
    assert_eq!(cat, 0);
    assert!(conf.is_nan());
  }

  #[test]
  fn power_calibration_raises_confidence() {
    let probs = array![0.1, 0.3];
    let (cat, plain) = category_confidence(0.5, probs.view(), None).unwrap();
    let (cat_tiny, calibrated) = category_confidence(0.5, probs.view(), Some(0.3)).unwrap();
    assert_eq!(cat, cat_tiny);
    assert_abs_diff_eq!(plain, 0.15);
    assert_abs_diff_eq!(calibrated, 0.15_f64.powf(0.3), epsilon = 1e-12);
    assert!(calibrated > plain && calibrated <= 1.0);
  }

  #[test]
  fn finalize_rescales_and_classifies() {
    let mut decoded = Array2::<f64>::zeros((2, 85));
    decoded[[0, 0]] = 256.0;
    decoded[[0, 1]] = 256.0;
    decoded[[0, 2]] = 100.0;
    decoded[[0, 3]] = 50.0;
    decoded[[0, 4]] = 0.9;
    decoded[[0, 5 + 17]] = 0.5;
    decoded[[1, 4]] = 0.1;
    decoded[[1, 5]] = 0.2;

    let letterbox = Letterbox {
      scale_x: 2.0,
      scale_y: 2.0,
      pad_left: 0.0,
      pad_top: 128.0,
    };
    let out = finalize(ModelVariant::YoloV3, &decoded, &letterbox).unwrap();
    assert_eq!(out.dim(), (2, DETECTION_COLUMNS));

    let r = out.row(0);
    assert_abs_diff_eq!(r[0], (206.0 - 0.0) / 2.0);
    assert_abs_diff_eq!(r[1], (231.0 - 128.0) / 2.0);
    assert_abs_diff_eq!(r[2], (306.0 - 0.0) / 2.0);
    assert_abs_diff_eq!(r[3], (281.0 - 128.0) / 2.0);
    assert_eq!(r[4], 17.0);
    assert_abs_diff_eq!(r[5], 0.45, epsilon = 1e-12);

    // 第二行保留，不做阈值过滤
    assert_eq!(out[[1, 4]], 0.0);
    assert_abs_diff_eq!(out[[1, 5]], 0.02, epsilon = 1e-12);
  }

  #[test]
  fn tiny_confidence_is_calibrated() {
    let mut decoded = Array2::<f64>::zeros((1, 85));
    decoded[[0, 4]] = 0.5;
    decoded[[0, 5]] = 0.5;
    let identity = Letterbox::identity();
    let plain = finalize(ModelVariant::YoloV4, &decoded, &identity).unwrap();
    let tiny = finalize(ModelVariant::YoloV3Tiny, &decoded, &identity).unwrap();
    assert_abs_diff_eq!(plain[[0, 5]], 0.25, epsilon = 1e-12);
    assert_abs_diff_eq!(tiny[[0, 5]], 0.25_f64.powf(0.3), epsilon = 1e-12);
  }

  #[test]
  fn wrong_width_is_rejected() {
    let identity = Letterbox::identity();
    for cols in [4, 5, 84, 86] {
      let decoded = Array2::from_elem((2, cols), 0.9);
      assert!(matches!(
        finalize(ModelVariant::YoloV3, &decoded, &identity),
        Err(DecodeError::ColumnMismatch { expected: 85, found }) if found == cols
      ));
    }
  }
}
