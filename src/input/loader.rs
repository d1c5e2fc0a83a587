// 该文件是 Jiejing （街景巡检） 项目的一部分。
// src/input/loader.rs - 有序并行图像加载
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

//! 多个线程并行解码，按提交顺序交付。
//!
//! 已提交但尚未交付的帧不超过 `prefetch` 张，消费者停止拉取后不会再有新的解码任务。

use std::{
  any::Any,
  collections::BTreeMap,
  iter::FusedIterator,
  panic::{AssertUnwindSafe, catch_unwind},
  path::{Path, PathBuf},
  sync::Arc,
  thread::JoinHandle,
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use image::RgbImage;
use tracing::{debug, error, warn};

use super::{FrameError, decode_frame};

#[derive(Debug)]
pub struct LoadedFrame {
  pub index: usize,
  pub path: PathBuf,
  pub image: Result<RgbImage, FrameError>,
}

type Job = (usize, PathBuf);

pub struct OrderedFrameLoader {
  paths: std::vec::IntoIter<PathBuf>,
  jobs: Option<Sender<Job>>,
  results: Receiver<LoadedFrame>,
  workers: Vec<JoinHandle<()>>,
  reorder: BTreeMap<usize, LoadedFrame>,
  next_submit: usize,
  next_yield: usize,
  prefetch: usize,
}

impl OrderedFrameLoader {
  pub fn new(paths: Vec<PathBuf>, workers: usize, prefetch: usize) -> Self {
    Self::with_decoder(paths, workers, prefetch, decode_frame)
  }

  /// 使用自定义解码函数；解码函数崩溃时该帧以 [`FrameError::Panicked`] 交付
  pub fn with_decoder<D>(paths: Vec<PathBuf>, workers: usize, prefetch: usize, decode: D) -> Self
  where
    D: Fn(&Path) -> Result<RgbImage, FrameError> + Send + Sync + 'static,
  {
    let workers = workers.max(1);
    let decode = Arc::new(decode);
    let (job_tx, job_rx) = unbounded::<Job>();
    let (result_tx, result_rx) = unbounded::<LoadedFrame>();

    let handles = (0..workers)
      .map(|worker| {
        let job_rx = job_rx.clone();
        let result_tx = result_tx.clone();
        let decode = decode.clone();
        std::thread::spawn(move || {
          for (index, path) in job_rx.iter() {
            let image = catch_unwind(AssertUnwindSafe(|| (*decode)(&path))).unwrap_or_else(
              |payload| {
                let message = panic_message(payload.as_ref());
                warn!("解码 {} 时线程崩溃: {}", path.display(), message);
                Err(FrameError::Panicked {
                  path: path.clone(),
                  message,
                })
              },
            );
            if result_tx.send(LoadedFrame { index, path, image }).is_err() {
              break;
            }
          }
          debug!("解码线程 {} 退出", worker);
        })
      })
      .collect();

    Self {
      paths: paths.into_iter(),
      jobs: Some(job_tx),
      results: result_rx,
      workers: handles,
      reorder: BTreeMap::new(),
      next_submit: 0,
      next_yield: 0,
      prefetch: prefetch.max(1),
    }
  }

  /// 已提交给解码线程的帧数
  pub fn submitted(&self) -> usize {
    self.next_submit
  }

  fn fill(&mut self) {
    let Some(jobs) = &self.jobs else {
      return;
    };
    while self.next_submit - self.next_yield < self.prefetch {
      let Some(path) = self.paths.next() else {
        break;
      };
      if jobs.send((self.next_submit, path)).is_err() {
        error!("解码线程已全部退出");
        self.jobs = None;
        return;
      }
      self.next_submit += 1;
    }
  }
}

impl Iterator for OrderedFrameLoader {
  type Item = LoadedFrame;

  fn next(&mut self) -> Option<LoadedFrame> {
    self.fill();
    while self.next_yield < self.next_submit {
      if let Some(frame) = self.reorder.remove(&self.next_yield) {
        self.next_yield += 1;
        self.fill();
        return Some(frame);
      }
      match self.results.recv() {
        Ok(frame) => {
          self.reorder.insert(frame.index, frame);
        }
        Err(_) => {
          error!("解码线程异常退出，第 {} 帧之后的图像丢失", self.next_yield);
          self.next_yield = self.next_submit;
          self.paths = Vec::new().into_iter();
        }
      }
    }
    None
  }
}

impl FusedIterator for OrderedFrameLoader {}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    message.to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "未知错误".to_string()
  }
}

impl Drop for OrderedFrameLoader {
  fn drop(&mut self) {
    // 关闭任务通道，线程处理完手上的任务后退出
    self.jobs = None;
    for handle in self.workers.drain(..) {
      let _ = handle.join();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn write_frames(dir: &std::path::Path, count: usize) -> Vec<PathBuf> {
    (0..count)
      .map(|i| {
        let path = dir.join(format!("{:03}.png", i));
        RgbImage::new(i as u32 + 1, 1).save(&path).unwrap();
        path
      })
      .collect()
  }

  #[test]
  fn frames_arrive_in_submission_order() {
    let dir = tempfile::tempdir().unwrap();
    let paths = write_frames(dir.path(), 20);
    let loader = OrderedFrameLoader::new(paths.clone(), 4, 6);
    let frames: Vec<LoadedFrame> = loader.collect();
    assert_eq!(frames.len(), 20);
    for (i, frame) in frames.iter().enumerate() {
      assert_eq!(frame.index, i);
      assert_eq!(frame.path, paths[i]);
      assert_eq!(frame.image.as_ref().unwrap().width(), i as u32 + 1);
    }
  }

  #[test]
  fn look_ahead_is_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let paths = write_frames(dir.path(), 30);
    let mut loader = OrderedFrameLoader::new(paths, 2, 3);
    assert!(loader.next().is_some());
    assert!(loader.submitted() <= 4);
  }

  #[test]
  fn missing_file_is_reported_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let mut paths = write_frames(dir.path(), 2);
    paths.insert(1, dir.path().join("gone.png"));
    let frames: Vec<LoadedFrame> = OrderedFrameLoader::new(paths, 2, 2).collect();
    assert!(frames[0].image.is_ok());
    assert!(matches!(frames[1].image, Err(FrameError::Io { .. })));
    assert!(frames[2].image.is_ok());
  }

  #[test]
  fn decoder_panic_is_reported_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let paths = write_frames(dir.path(), 4);
    let loader = OrderedFrameLoader::with_decoder(paths, 1, 2, |path: &Path| {
      if path.ends_with("001.png") {
        panic!("bad header");
      }
      decode_frame(path)
    });
    let frames: Vec<LoadedFrame> = loader.collect();
    assert_eq!(frames.len(), 4);
    match &frames[1].image {
      Err(FrameError::Panicked { message, .. }) => assert_eq!(message, "bad header"),
      other => panic!("unexpected result: {:?}", other.as_ref().map(|_| ())),
    }
    assert!(frames[0].image.is_ok());
    assert!(frames[2].image.is_ok());
    assert!(frames[3].image.is_ok());
  }
}
