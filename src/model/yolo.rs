// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/yolo.rs - YOLO v3/v4 检测模型
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

use image::RgbImage;
use ndarray::Array2;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{
  DetectResult, Model,
  decode::{DecodeError, apply_anchors},
  postprocess::finalize,
  preprocess::{TensorLayout, to_input_tensor},
};
use crate::{
  FromUrl, FromUrlWithScheme,
  config::{Config, ConfigError},
  framework::{Backend, Framework, FrameworkError, InputFeed},
  session::Session,
};

#[derive(Error, Debug)]
pub enum YoloError {
  #[error("配置错误: {0}")]
  Config(#[from] ConfigError),
  #[error("推理框架错误: {0}")]
  Framework(#[from] FrameworkError),
  #[error("解码错误: {0}")]
  Decode(#[from] DecodeError),
  #[error("会话尚未预处理, 请先调用 prep_image")]
  NotPrepared,
}

/// YOLO 检测器，推理框架在构造时确定
pub struct Yolo<F: Framework = Backend> {
  config: Config,
  framework: F,
}

impl Yolo<Backend> {
  pub fn new(config: Config) -> Result<Self, YoloError> {
    let framework = Backend::new(&config)?;
    Ok(Yolo { config, framework })
  }
}

impl FromUrl for Yolo<Backend> {
  type Error = YoloError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    Yolo::new(Config::from_url(url)?)
  }
}

impl FromUrlWithScheme for Yolo<Backend> {
  const SCHEME: &'static str = Config::SCHEME;
}

impl<F: Framework> Yolo<F> {
  pub fn with_framework(config: Config, framework: F) -> Self {
    if framework.kind() != config.framework {
      warn!(
        "配置的推理框架 {} 与实际框架 {} 不一致",
        config.framework,
        framework.kind()
      );
    }
    Yolo { config, framework }
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn framework(&self) -> &F {
    &self.framework
  }

  /// 缩放填充图像并生成模型输入，结果写入 `sess.yolo_input`
  pub fn prep_image(&self, sess: &mut Session) {
    let size = self.config.model.input_size() as u32;
    let layout = TensorLayout::for_backend(self.config.framework);
    let precision = self.config.input_precision();

    let tensor = to_input_tensor(sess.padding_image(size, size), layout, precision);
    debug!("输入张量 {:?}, 排布 {:?}", tensor.shape(), layout);
    sess.yolo_input = Some(InputFeed {
      name: self.framework.input_name().to_string(),
      tensor,
    });
  }

  /// 返回检测矩阵，每行为 (x_min, y_min, x_max, y_max, category_id, confidence)，
  /// 坐标为原图像素
  pub fn inference(&self, sess: &Session) -> Result<Array2<f64>, YoloError> {
    let (Some(feed), Some(letterbox)) = (sess.yolo_input.as_ref(), sess.letterbox()) else {
      error!("会话尚未预处理");
      return Err(YoloError::NotPrepared);
    };

    let preds = self.framework.inference(feed)?;
    debug!(
      "模型输出形状: {:?}",
      preds.iter().map(|p| p.shape().to_vec()).collect::<Vec<_>>()
    );
    let decoded = apply_anchors(self.config.model, &preds)?;
    Ok(finalize(self.config.model, &decoded, letterbox)?)
  }
}

impl<F: Framework> Model for Yolo<F> {
  type Input = RgbImage;
  type Output = DetectResult;
  type Error = YoloError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let mut sess = Session::from_rgb(input);
    self.prep_image(&mut sess);
    let detections = self.inference(&sess)?;
    info!("检测到 {} 个候选框", detections.nrows());
    Ok(DetectResult::from_matrix(&detections)?)
  }
}
