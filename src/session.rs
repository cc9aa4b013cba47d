// 该文件是 Shanan （山南西风） 项目的一部分。
// src/session.rs - 单次推理的会话状态
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

use image::{RgbImage, imageops::FilterType};
use ndarray::{Array3, ArrayView3};
use tracing::debug;

use crate::framework::InputFeed;

/// 填充区域的像素值
pub const PAD_VALUE: u8 = 128;

/// 等比缩放并居中填充的参数，用于把检测框映射回原图
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
  pub scale_x: f64,
  pub scale_y: f64,
  pub pad_left: f64,
  pub pad_top: f64,
}

impl Letterbox {
  /// 不做任何变换
  pub fn identity() -> Self {
    Letterbox {
      scale_x: 1.0,
      scale_y: 1.0,
      pad_left: 0.0,
      pad_top: 0.0,
    }
  }

  /// 填充图像上的 (x_min, y_min, x_max, y_max) 转换为原图坐标，不裁剪
  pub fn rescale_xyxy(&self, xyxy: [f64; 4]) -> [f64; 4] {
    let [x0, y0, x1, y1] = xyxy;
    [
      (x0 - self.pad_left) / self.scale_x,
      (y0 - self.pad_top) / self.scale_y,
      (x1 - self.pad_left) / self.scale_x,
      (y1 - self.pad_top) / self.scale_y,
    ]
  }
}

/// 一张图像从预处理到后处理所需的全部状态
pub struct Session {
  image: RgbImage,
  pad_image: Option<Array3<u8>>,
  letterbox: Option<Letterbox>,
  /// 由 `Yolo::prep_image` 写入
  pub yolo_input: Option<InputFeed>,
}

impl Session {
  pub fn from_rgb(image: &RgbImage) -> Self {
    Session {
      image: image.clone(),
      pad_image: None,
      letterbox: None,
      yolo_input: None,
    }
  }

  pub fn image(&self) -> &RgbImage {
    &self.image
  }

  /// 缩放并填充到 `model_height` x `model_width`，结果为 HWC、BGR 排布
  pub fn padding_image(&mut self, model_height: u32, model_width: u32) -> ArrayView3<'_, u8> {
    let (width, height) = self.image.dimensions();
    let mut canvas = Array3::from_elem(
      (model_height as usize, model_width as usize, 3),
      PAD_VALUE,
    );

    let letterbox = if width == 0 || height == 0 || model_width == 0 || model_height == 0 {
      Letterbox::identity()
    } else {
      let scale = f64::min(
        model_width as f64 / width as f64,
        model_height as f64 / height as f64,
      );
      let new_width = ((width as f64 * scale).round() as u32).clamp(1, model_width);
      let new_height = ((height as f64 * scale).round() as u32).clamp(1, model_height);
      let pad_left = (model_width - new_width) / 2;
      let pad_top = (model_height - new_height) / 2;

      let resized = image::imageops::resize(&self.image, new_width, new_height, FilterType::Triangle);
      for (x, y, pixel) in resized.enumerate_pixels() {
        let [r, g, b] = pixel.0;
        let (row, col) = ((y + pad_top) as usize, (x + pad_left) as usize);
        canvas[[row, col, 0]] = b;
        canvas[[row, col, 1]] = g;
        canvas[[row, col, 2]] = r;
      }

      debug!(
        "图像 {}x{} 缩放为 {}x{}, 填充 ({}, {})",
        width, height, new_width, new_height, pad_left, pad_top
      );
      Letterbox {
        scale_x: new_width as f64 / width as f64,
        scale_y: new_height as f64 / height as f64,
        pad_left: pad_left as f64,
        pad_top: pad_top as f64,
      }
    };

    self.letterbox = Some(letterbox);
    self.yolo_input = None;
    self.pad_image.insert(canvas).view()
  }

  pub fn pad_image(&self) -> Option<ArrayView3<'_, u8>> {
    self.pad_image.as_ref().map(|p| p.view())
  }

  pub fn letterbox(&self) -> Option<&Letterbox> {
    self.letterbox.as_ref()
  }

  pub fn rescale_xyxy(&self, xyxy: [f64; 4]) -> Option<[f64; 4]> {
    self.letterbox.map(|l| l.rescale_xyxy(xyxy))
  }
}
