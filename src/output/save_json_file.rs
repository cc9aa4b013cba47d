// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/save_json_file.rs - 以 JSON Lines 记录检测结果
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

use std::{
  fs::OpenOptions,
  io::Write,
  path::{Path, PathBuf},
};

use image::RgbImage;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  model::{DetectItem, DetectResult, labels::label_of},
  output::Render,
};

#[derive(Error, Debug)]
pub enum JsonOutputError {
  #[error("URI 方案不匹配: 期望 {expected}, 实际为 {found}")]
  SchemeMismatch {
    expected: &'static str,
    found: String,
  },
  #[error("参数 {name} 无效: {value}")]
  InvalidParameter { name: &'static str, value: String },
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("JSON 序列化错误: {0}")]
  Json(#[from] serde_json::Error),
}

/// 每帧追加一行 JSON，`min_score` 只影响写出的内容
pub struct JsonOutput {
  path: PathBuf,
  min_score: f32,
}

#[derive(Serialize)]
struct LabeledItem<'a> {
  label: &'static str,
  #[serde(flatten)]
  item: &'a DetectItem,
}

#[derive(Serialize)]
struct FrameRecord<'a> {
  timestamp: String,
  width: u32,
  height: u32,
  candidates: usize,
  detections: Vec<LabeledItem<'a>>,
}

impl FromUrlWithScheme for JsonOutput {
  const SCHEME: &'static str = "json";
}

impl FromUrl for JsonOutput {
  type Error = JsonOutputError;

  /// 例如 `json:///tmp/result.jsonl?min_score=0.25`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际为 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(JsonOutputError::SchemeMismatch {
        expected: Self::SCHEME,
        found: url.scheme().to_string(),
      });
    }

    let mut output = JsonOutput::new(url.path());
    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "min_score" => {
          output.min_score = value
            .parse()
            .map_err(|_| JsonOutputError::InvalidParameter {
              name: "min_score",
              value: value.to_string(),
            })?;
        }
        other => warn!("忽略未知参数: {}", other),
      }
    }
    Ok(output)
  }
}

impl JsonOutput {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    JsonOutput {
      path: path.into(),
      min_score: 0.0,
    }
  }

  pub fn with_min_score(mut self, min_score: f32) -> Self {
    self.min_score = min_score;
    self
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn append_line(&self, line: &str) -> Result<(), JsonOutputError> {
    if let Some(parent) = self.path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new()
      .create(true)
      .append(true)
      .open(&self.path)?;
    writeln!(file, "{line}")?;
    Ok(())
  }
}

impl Render<RgbImage, DetectResult> for JsonOutput {
  type Error = JsonOutputError;

  fn render_result(&self, frame: &RgbImage, result: &DetectResult) -> Result<(), Self::Error> {
    let detections: Vec<_> = result
      .items
      .iter()
      .filter(|item| item.score >= self.min_score)
      .map(|item| LabeledItem {
        label: label_of(item.class_id),
        item,
      })
      .collect();

    let record = FrameRecord {
      timestamp: chrono::Local::now().to_rfc3339(),
      width: frame.width(),
      height: frame.height(),
      candidates: result.len(),
      detections,
    };
    self.append_line(&serde_json::to_string(&record)?)?;

    debug!(
      "写入 {} 个检测结果到 {}",
      record.detections.len(),
      self.path.display()
    );
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn result() -> DetectResult {
    DetectResult {
      items: vec![
        DetectItem {
          class_id: 0,
          score: 0.9,
          bbox: [1.0, 2.0, 3.0, 4.0],
        },
        DetectItem {
          class_id: 2,
          score: 0.1,
          bbox: [0.0, 0.0, 1.0, 1.0],
        },
      ]
      .into_boxed_slice(),
    }
  }

  #[test]
  fn appends_one_line_per_frame() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested/out.jsonl");
    let url = Url::parse(&format!("json://{}?min_score=0.5", path.display())).unwrap();
    let output = JsonOutput::from_url(&url).unwrap();
    assert_eq!(output.path(), path.as_path());

    let frame = RgbImage::new(20, 10);
    output.render_result(&frame, &result()).unwrap();
    output.render_result(&frame, &result()).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<_> = text.lines().collect();
    assert_eq!(lines.len(), 2);

    let record: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(record["width"], 20);
    assert_eq!(record["height"], 10);
    assert_eq!(record["candidates"], 2);
    let detections = record["detections"].as_array().unwrap();
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0]["label"], "person");
    assert_eq!(detections[0]["class_id"], 0);
    assert_eq!(detections[0]["bbox"][3], 4.0);
    assert!(chrono::DateTime::parse_from_rfc3339(record["timestamp"].as_str().unwrap()).is_ok());
  }

  #[test]
  fn keeps_everything_without_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let output = JsonOutput::new(dir.path().join("all.jsonl"));
    output.render_result(&RgbImage::new(1, 1), &result()).unwrap();
    let text = std::fs::read_to_string(output.path()).unwrap();
    let record: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
    assert_eq!(record["detections"].as_array().unwrap().len(), 2);
    assert_eq!(record["detections"][1]["label"], "car");
  }

  #[test]
  fn rejects_bad_parameters() {
    let url = Url::parse("json:///tmp/out.jsonl?min_score=high").unwrap();
    assert!(matches!(
      JsonOutput::from_url(&url),
      Err(JsonOutputError::InvalidParameter { name: "min_score", .. })
    ));
    let url = Url::parse("image:///tmp/out.jsonl").unwrap();
    assert!(matches!(
      JsonOutput::from_url(&url),
      Err(JsonOutputError::SchemeMismatch { .. })
    ));
  }
}
