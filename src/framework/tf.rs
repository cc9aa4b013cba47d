// 该文件是 Shanan （山南西风） 项目的一部分。
// src/framework/tf.rs - TensorFlow 推理框架（冻结图与 SavedModel）
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

use ndarray::ArrayD;
use tensorflow::{
  Graph, ImportGraphDefOptions, Operation, Output, SavedModelBundle, Session, SessionOptions,
  SessionRunArgs, Shape, Tensor,
};
use tracing::debug;

use super::{
  ArtifactPath, Framework, FrameworkError, InputFeed, check_resolution, select_outputs,
  squeeze_batch,
};
use crate::config::{BackendKind, Config, ModelVariant};

const TF_FEED_NAME: &str = "images";
const TF_GRAPH_INPUT: &str = "x";
const SAVED_MODEL_TAG: &str = "serve";
const SAVED_MODEL_SIGNATURE: &str = "serving_default";

fn shape_dims(shape: &Shape) -> Vec<i64> {
  (0..shape.dims().unwrap_or(0))
    .map(|i| shape[i].unwrap_or(-1))
    .collect()
}

fn run_session(
  session: &Session,
  input_op: &Operation,
  input_index: i32,
  outputs: &[(Operation, i32)],
  feed: &InputFeed,
) -> Result<Vec<ArrayD<f32>>, FrameworkError> {
  let input = feed.tensor.as_f32()?;
  let dims: Vec<u64> = input.shape().iter().map(|&d| d as u64).collect();
  let data = input
    .as_slice()
    .ok_or_else(|| FrameworkError::InputMismatch("输入张量不连续".to_string()))?;
  let tensor = Tensor::<f32>::new(&dims)
    .with_values(data)
    .map_err(FrameworkError::engine)?;

  let mut args = SessionRunArgs::new();
  args.add_feed(input_op, input_index, &tensor);
  let tokens: Vec<_> = outputs
    .iter()
    .map(|(op, index)| args.request_fetch(op, *index))
    .collect();
  session.run(&mut args).map_err(FrameworkError::engine)?;

  let mut preds = Vec::with_capacity(tokens.len());
  for token in tokens {
    let out: Tensor<f32> = args.fetch(token).map_err(FrameworkError::engine)?;
    let dims: Vec<usize> = out.dims().iter().map(|&d| d as usize).collect();
    preds.push(squeeze_batch(&dims, out.to_vec())?);
  }
  Ok(preds)
}

/// TensorFlow 冻结图（`{model}.pb`），NHWC 输入
pub struct YoloTf {
  session: Session,
  input_op: Operation,
  outputs: Vec<(Operation, i32)>,
}

impl YoloTf {
  pub fn new(config: &Config, artifact: &ArtifactPath) -> Result<Self, FrameworkError> {
    let path = artifact.path();
    let proto = std::fs::read(path).map_err(|e| FrameworkError::malformed(path, e))?;
    debug!("冻结图大小: {:.2} MB", proto.len() as f64 / (1024.0 * 1024.0));

    let mut graph = Graph::new();
    graph
      .import_graph_def(&proto, &ImportGraphDefOptions::new())
      .map_err(|e| FrameworkError::malformed(path, e))?;

    let input_op = graph
      .operation_by_name_required(TF_GRAPH_INPUT)
      .map_err(|e| FrameworkError::malformed(path, e))?;
    let shape = graph
      .tensor_shape(Output {
        operation: input_op.clone(),
        index: 0,
      })
      .map_err(|e| FrameworkError::malformed(path, e))?;
    check_resolution(BackendKind::Tf, &shape_dims(&shape), (1, 2), config.model.input_size())?;

    let output_names: &[&str] = match config.model {
      ModelVariant::YoloV3Tiny => &["Identity", "Identity_1"],
      ModelVariant::YoloV3 | ModelVariant::YoloV4 => &["Identity", "Identity_1", "Identity_2"],
    };
    let outputs = output_names
      .iter()
      .map(|name| {
        graph
          .operation_by_name_required(name)
          .map(|op| (op, 0))
          .map_err(|e| FrameworkError::malformed(path, e))
      })
      .collect::<Result<Vec<_>, _>>()?;

    let session =
      Session::new(&SessionOptions::new(), &graph).map_err(|e| FrameworkError::malformed(path, e))?;

    Ok(YoloTf {
      session,
      input_op,
      outputs,
    })
  }
}

impl Framework for YoloTf {
  fn kind(&self) -> BackendKind {
    BackendKind::Tf
  }

  fn input_name(&self) -> &str {
    TF_FEED_NAME
  }

  fn inference(&self, feed: &InputFeed) -> Result<Vec<ArrayD<f32>>, FrameworkError> {
    feed.expect_name(TF_FEED_NAME)?;
    run_session(&self.session, &self.input_op, 0, &self.outputs, feed)
  }
}

/// 由 ONNX 转换得到的 SavedModel 目录，NCHW 输入
pub struct YoloOnnxTf {
  bundle: SavedModelBundle,
  input_op: Operation,
  input_index: i32,
  outputs: Vec<(Operation, i32)>,
}

impl YoloOnnxTf {
  pub fn new(config: &Config, artifact: &ArtifactPath) -> Result<Self, FrameworkError> {
    let path = artifact.path();
    let mut graph = Graph::new();
    let bundle = SavedModelBundle::load(&SessionOptions::new(), [SAVED_MODEL_TAG], &mut graph, path)
      .map_err(|e| FrameworkError::malformed(path, e))?;

    let signature = bundle
      .meta_graph_def()
      .get_signature(SAVED_MODEL_SIGNATURE)
      .map_err(|e| FrameworkError::malformed(path, e))?;
    if signature.inputs().len() != 1 {
      return Err(FrameworkError::ShapeMismatch(format!(
        "预期 1 个输入, 实际为 {}",
        signature.inputs().len()
      )));
    }
    let input_info = signature
      .get_input(TF_FEED_NAME)
      .map_err(|e| FrameworkError::malformed(path, e))?;
    check_resolution(
      BackendKind::OnnxTf,
      &shape_dims(input_info.shape()),
      (2, 3),
      config.model.input_size(),
    )?;
    let input_op = graph
      .operation_by_name_required(&input_info.name().name)
      .map_err(|e| FrameworkError::malformed(path, e))?;
    let input_index = input_info.name().index;

    let declared: Vec<String> = signature.outputs().keys().cloned().collect();
    let outputs = select_outputs(BackendKind::OnnxTf, &declared)?
      .iter()
      .map(|key| {
        let info = signature
          .get_output(key)
          .map_err(|e| FrameworkError::malformed(path, e))?;
        graph
          .operation_by_name_required(&info.name().name)
          .map(|op| (op, info.name().index))
          .map_err(|e| FrameworkError::malformed(path, e))
      })
      .collect::<Result<Vec<_>, _>>()?;
    debug!("SavedModel 输出数量: {}", outputs.len());

    Ok(YoloOnnxTf {
      bundle,
      input_op,
      input_index,
      outputs,
    })
  }
}

impl Framework for YoloOnnxTf {
  fn kind(&self) -> BackendKind {
    BackendKind::OnnxTf
  }

  fn input_name(&self) -> &str {
    TF_FEED_NAME
  }

  fn inference(&self, feed: &InputFeed) -> Result<Vec<ArrayD<f32>>, FrameworkError> {
    feed.expect_name(TF_FEED_NAME)?;
    run_session(
      &self.bundle.session,
      &self.input_op,
      self.input_index,
      &self.outputs,
      feed,
    )
  }
}
